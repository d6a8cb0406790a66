//! Algorithm Orchestrator
//!
//! Runs the classifier engine of each requested algorithm over the input
//! records. Per algorithm it injects defaults for required columns the input
//! lacks, binds the input to a job-unique file when the engine asks for it, and
//! checks that every record received exactly one cause.
//!
//! Failure policy: with several algorithms, a failing non-primary algorithm is
//! logged and dropped while the rest continue. A failure of the primary (first)
//! algorithm fails the run.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::engines::{EngineError, EngineRegistry, InputBinding, Invocation};
use crate::models::{AgeGroup, Algorithm, CauseAssignment, DroppedAlgorithm, RecordTable};
use crate::services::log_stream::{Diagnostics, OutputBuffer};

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("No algorithms requested")]
    NoAlgorithms,

    #[error("No engine registered for {0}")]
    NoEngine(Algorithm),

    #[error("Failed to bind input for {algorithm}: {reason}")]
    Binding { algorithm: Algorithm, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Classification of one algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmOutput {
    pub algorithm: Algorithm,
    /// One cause per input record, in input order
    pub assignments: Vec<CauseAssignment>,
    /// Uncalibrated fraction per free-text label
    pub csmf: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOutput {
    /// Surviving algorithms in request order
    pub outputs: Vec<AlgorithmOutput>,
    pub dropped: Vec<DroppedAlgorithm>,
}

impl OrchestratorOutput {
    pub fn algorithms(&self) -> Vec<Algorithm> {
        self.outputs.iter().map(|o| o.algorithm).collect()
    }
}

/// Per-job context shared by every engine call
pub struct RunContext<'a> {
    pub job_id: Uuid,
    pub age_group: AgeGroup,
    /// Directory receiving input bindings
    pub scratch_dir: &'a Path,
    pub output: &'a OutputBuffer,
    pub diagnostics: &'a Diagnostics,
}

pub struct AlgorithmOrchestrator<'a> {
    registry: &'a EngineRegistry,
}

impl<'a> AlgorithmOrchestrator<'a> {
    pub fn new(registry: &'a EngineRegistry) -> Self {
        Self { registry }
    }

    pub fn run(
        &self,
        ctx: &RunContext<'_>,
        records: &RecordTable,
        algorithms: &[Algorithm],
    ) -> Result<OrchestratorOutput, OrchestrateError> {
        if algorithms.is_empty() {
            return Err(OrchestrateError::NoAlgorithms);
        }

        let mut result = OrchestratorOutput::default();
        for (i, &algorithm) in algorithms.iter().enumerate() {
            ctx.output.line(&format!("Running {} ({} records)", algorithm, records.len()));

            match self.run_one(ctx, records, algorithm) {
                Ok(output) => {
                    tracing::info!(job_id = %ctx.job_id, algorithm = %algorithm, "Classification complete");
                    result.outputs.push(output);
                }
                Err(e) if i > 0 => {
                    ctx.diagnostics.warn(format!("{} failed and was dropped: {}", algorithm, e));
                    result.dropped.push(DroppedAlgorithm {
                        algorithm,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    fn run_one(
        &self,
        ctx: &RunContext<'_>,
        records: &RecordTable,
        algorithm: Algorithm,
    ) -> Result<AlgorithmOutput, OrchestrateError> {
        let engine = self
            .registry
            .get(algorithm)
            .ok_or(OrchestrateError::NoEngine(algorithm))?;

        let required: Vec<(String, String)> = engine
            .required_columns(ctx.age_group)
            .into_iter()
            .map(|c| (c.name, c.default))
            .collect();
        let (prepared, injected) = records.with_defaults(&required);
        if !injected.is_empty() {
            ctx.diagnostics.info(format!(
                "{}: filled missing columns with defaults: {}",
                algorithm,
                injected.join(", ")
            ));
        }

        // Released when this call returns, whatever the outcome
        let binding = if engine.requires_exclusive_binding() {
            Some(
                InputBinding::bind(ctx.scratch_dir, ctx.job_id, algorithm, &prepared).map_err(|e| {
                    OrchestrateError::Binding {
                        algorithm,
                        reason: e.to_string(),
                    }
                })?,
            )
        } else {
            None
        };

        let assignments = engine.classify(&Invocation {
            job_id: ctx.job_id,
            algorithm,
            age_group: ctx.age_group,
            records: &prepared,
            binding: binding.as_ref(),
            output: ctx.output,
            diagnostics: ctx.diagnostics,
        })?;

        let assignments = align_to_records(algorithm, records, assignments)?;
        let csmf = label_fractions(&assignments);
        Ok(AlgorithmOutput {
            algorithm,
            assignments,
            csmf,
        })
    }
}

/// Reorder engine output to input order, requiring exactly one cause per record
fn align_to_records(
    algorithm: Algorithm,
    records: &RecordTable,
    assignments: Vec<CauseAssignment>,
) -> Result<Vec<CauseAssignment>, EngineError> {
    let invalid = |reason: String| EngineError::InvalidOutput {
        engine: algorithm.to_string(),
        reason,
    };

    let ids = records.ids().map_err(|e| invalid(e.to_string()))?;
    if assignments.len() != ids.len() {
        return Err(invalid(format!(
            "{} causes for {} records",
            assignments.len(),
            ids.len()
        )));
    }

    let mut by_id: HashMap<String, String> = HashMap::with_capacity(assignments.len());
    for a in assignments {
        if by_id.insert(a.id.clone(), a.cause).is_some() {
            return Err(invalid(format!("record '{}' assigned twice", a.id)));
        }
    }

    ids.into_iter()
        .map(|id| {
            let cause = by_id
                .remove(&id)
                .ok_or_else(|| invalid(format!("record '{}' has no cause", id)))?;
            Ok(CauseAssignment { id, cause })
        })
        .collect()
}

/// Fraction of records per label
pub fn label_fractions(assignments: &[CauseAssignment]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for a in assignments {
        *counts.entry(a.cause.clone()).or_default() += 1;
    }
    let n = assignments.len().max(1) as f64;
    counts.into_iter().map(|(k, c)| (k, c as f64 / n)).collect()
}
