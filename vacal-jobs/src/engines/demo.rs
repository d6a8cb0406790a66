//! Deterministic built-in classifier
//!
//! Reads the `s_<cause>` symptom indicators of the sample dataset and assigns a
//! cause per record, agreeing with the indicated cause at an algorithm-specific
//! rate. Labels use each algorithm's own vocabulary, including spellings the
//! categorizer does not recognize. Records without indicators get a
//! hash-derived cause, so any input is accepted.
//!
//! The InSilicoVA engine reads its input back from the bound file, and the
//! EAVA engine requires the `age_group` and `fb_day0` columns.

use super::{ClassifierEngine, EngineError, Invocation, RequiredColumn};
use crate::causes::{canonical_causes, representative_label};
use crate::models::{AgeGroup, Algorithm, CauseAssignment, RecordTable};
use crate::services::demo_data::{stable_hash, stable_unit, SYMPTOM_PREFIX};

pub struct DemoEngine {
    algorithm: Algorithm,
}

impl DemoEngine {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    /// Probability the assigned cause matches the indicated one
    fn agreement(&self) -> f64 {
        match self.algorithm {
            Algorithm::InterVa => 0.6,
            Algorithm::InSilicoVa => 0.7,
            Algorithm::Eava => 0.75,
        }
    }

    fn label(&self, age_group: AgeGroup, cause: &str) -> String {
        let own = match (self.algorithm, age_group, cause) {
            (Algorithm::InterVa, _, "other") => Some("Undetermined"),
            (Algorithm::InterVa, AgeGroup::Child, "diarrhea") => Some("Diarrhea/Dysentery"),
            (Algorithm::InterVa, AgeGroup::Neonate, "sepsis_meningitis_inf") => Some("Sepsis"),
            (Algorithm::InterVa, AgeGroup::Neonate, "pneumonia") => Some("Acute resp infect incl pneumonia"),
            (Algorithm::Eava, AgeGroup::Child, "injury") => Some("Injury"),
            (Algorithm::Eava, AgeGroup::Child, "hiv") => Some("HIV"),
            (Algorithm::Eava, AgeGroup::Child, "severewasting") => Some("Malnutrition"),
            (Algorithm::Eava, AgeGroup::Neonate, "prematurity") => Some("Preterm"),
            _ => None,
        };
        own.or_else(|| representative_label(age_group, cause))
            .unwrap_or("Undetermined")
            .to_string()
    }

    /// Cause labels for `records`, without writing any output
    pub fn assign(&self, age_group: AgeGroup, records: &RecordTable) -> Result<Vec<CauseAssignment>, EngineError> {
        let causes = canonical_causes(age_group);
        let ids = records.ids().map_err(|e| EngineError::Failed {
            engine: self.algorithm.to_string(),
            reason: e.to_string(),
        })?;
        let symptom_cols: Vec<Option<usize>> = causes
            .iter()
            .map(|c| records.column_index(&format!("{}{}", SYMPTOM_PREFIX, c)))
            .collect();
        let algo = self.algorithm.as_str();

        let assignments = ids
            .iter()
            .zip(&records.rows)
            .map(|(id, row)| {
                let indicated: Vec<usize> = symptom_cols
                    .iter()
                    .enumerate()
                    .filter(|(_, col)| col.and_then(|c| row.get(c)).is_some_and(|v| v == "y"))
                    .map(|(k, _)| k)
                    .collect();

                let spread = (stable_hash(&[algo, "spread", id]) % causes.len() as u64) as usize;
                let cause = if indicated.is_empty() {
                    spread
                } else if stable_unit(&[algo, "agree", id]) < self.agreement() {
                    indicated[(stable_hash(&[algo, "pick", id]) % indicated.len() as u64) as usize]
                } else {
                    spread
                };
                CauseAssignment::new(id.as_str(), self.label(age_group, causes[cause]))
            })
            .collect();
        Ok(assignments)
    }
}

impl ClassifierEngine for DemoEngine {
    fn required_columns(&self, age_group: AgeGroup) -> Vec<RequiredColumn> {
        match self.algorithm {
            Algorithm::Eava => vec![
                RequiredColumn::new("age_group", age_group.as_str()),
                RequiredColumn::new("fb_day0", "n"),
            ],
            _ => Vec::new(),
        }
    }

    fn requires_exclusive_binding(&self) -> bool {
        self.algorithm == Algorithm::InSilicoVa
    }

    fn classify(&self, invocation: &Invocation<'_>) -> Result<Vec<CauseAssignment>, EngineError> {
        let failed = |reason: String| EngineError::Failed {
            engine: self.algorithm.to_string(),
            reason,
        };

        for required in self.required_columns(invocation.age_group) {
            if invocation.records.column_index(&required.name).is_none() {
                return Err(failed(format!("input lacks column '{}'", required.name)));
            }
        }

        let bound;
        let records = if self.requires_exclusive_binding() {
            let binding = invocation
                .binding
                .ok_or_else(|| failed("input was not bound".to_string()))?;
            let text = std::fs::read_to_string(binding.path())
                .map_err(|e| failed(format!("cannot read bound input {}: {}", binding.name(), e)))?;
            bound = RecordTable::from_csv(&text).map_err(|e| failed(e.to_string()))?;
            &bound
        } else {
            invocation.records
        };

        invocation.output.line(&format!(
            "{}: classifying {} records ({})",
            self.algorithm,
            records.len(),
            invocation.age_group
        ));
        let assignments = self.assign(invocation.age_group, records)?;
        invocation
            .output
            .line(&format!("{}: assigned causes to {} records", self.algorithm, assignments.len()));
        Ok(assignments)
    }
}
