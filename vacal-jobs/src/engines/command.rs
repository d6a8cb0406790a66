//! External command classifier
//!
//! Runs a configured program once per call:
//!
//! ```text
//! <program> <args...> --input <bound.csv> --output <causes.csv> --age-group <neonate|child>
//! ```
//!
//! The program's stdout and stderr go to the job's output buffer. It must write
//! a CSV with an `ID` column and a `cause` column (case-insensitive).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use vacal_common::config::EngineCommandConfig;

use super::{ClassifierEngine, EngineError, Invocation, RequiredColumn};
use crate::models::{AgeGroup, Algorithm, CauseAssignment, RecordTable, ID_COLUMN};

/// Placeholder in required-column defaults replaced by the job's age group
const AGE_GROUP_PLACEHOLDER: &str = "{age_group}";

pub struct CommandEngine {
    algorithm: Algorithm,
    program: PathBuf,
    args: Vec<String>,
    required_columns: BTreeMap<String, String>,
}

impl CommandEngine {
    pub fn from_config(algorithm: Algorithm, config: &EngineCommandConfig) -> Self {
        Self {
            algorithm,
            program: config.program.clone(),
            args: config.args.clone(),
            required_columns: config.required_columns.clone(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Failed {
            engine: self.algorithm.to_string(),
            reason: reason.into(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidOutput {
            engine: self.algorithm.to_string(),
            reason: reason.into(),
        }
    }

    fn read_output(&self, text: &str) -> Result<Vec<CauseAssignment>, EngineError> {
        let table = RecordTable::from_csv(text).map_err(|e| self.invalid(e.to_string()))?;
        let id_col = table
            .column_index_ignore_case(ID_COLUMN)
            .ok_or_else(|| self.invalid("missing ID column"))?;
        let cause_col = table
            .column_index_ignore_case("cause")
            .ok_or_else(|| self.invalid("missing cause column"))?;

        table
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| match (row.get(id_col), row.get(cause_col)) {
                (Some(id), Some(cause)) => Ok(CauseAssignment::new(id.as_str(), cause.as_str())),
                _ => Err(self.invalid(format!("row {} is incomplete", i + 1))),
            })
            .collect()
    }
}

impl ClassifierEngine for CommandEngine {
    fn required_columns(&self, age_group: AgeGroup) -> Vec<RequiredColumn> {
        self.required_columns
            .iter()
            .map(|(name, default)| {
                RequiredColumn::new(name.as_str(), default.replace(AGE_GROUP_PLACEHOLDER, age_group.as_str()))
            })
            .collect()
    }

    /// The program reads its input from a file path
    fn requires_exclusive_binding(&self) -> bool {
        true
    }

    fn classify(&self, invocation: &Invocation<'_>) -> Result<Vec<CauseAssignment>, EngineError> {
        let binding = invocation
            .binding
            .ok_or_else(|| self.failed("input was not bound to a file"))?;
        let output_path = binding.path().with_extension("causes.csv");

        let stdout = invocation
            .output
            .child_stdio()
            .map_err(|e| self.failed(format!("cannot redirect output: {}", e)))?;
        let stderr = invocation
            .output
            .child_stdio()
            .map_err(|e| self.failed(format!("cannot redirect output: {}", e)))?;

        tracing::debug!(
            job_id = %invocation.job_id,
            algorithm = %self.algorithm,
            program = %self.program.display(),
            "Running external classifier"
        );

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--input")
            .arg(binding.path())
            .arg("--output")
            .arg(&output_path)
            .arg("--age-group")
            .arg(invocation.age_group.as_str())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|e| EngineError::Unavailable {
                engine: self.algorithm.to_string(),
                reason: format!("cannot run {}: {}", self.program.display(), e),
            })?;

        if !status.success() {
            let _ = std::fs::remove_file(&output_path);
            return Err(self.failed(format!("{} exited with {}", self.program.display(), status)));
        }

        let text = std::fs::read_to_string(&output_path)
            .map_err(|e| self.invalid(format!("cannot read {}: {}", output_path.display(), e)));
        let _ = std::fs::remove_file(&output_path);
        self.read_output(&text?)
    }
}
