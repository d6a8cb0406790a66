//! Job worker
//!
//! Runs one job from start to finish. The worker is the only writer of its
//! job's status:
//!
//! 1. claim the job (Pending → Running); anything else is left untouched
//! 2. start the Log Stream Pipeline
//! 3. run the type-specific pipeline on a blocking thread
//! 4. register output files
//! 5. finish the log pipeline (diagnostics flushed, final sweep done)
//! 6. append the closing log line and write exactly one terminal update
//!
//! Any error after the claim fails the job rather than leaving it Running.

use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use vacal_common::{Error, Result};

use crate::calibration::{CalibrationEngine, CalibrationError, CalibrationRequest, CalibrationStage};
use crate::causes::{BroadCauseMap, CauseCategorizer};
use crate::config::ServiceConfig;
use crate::db::{jobs, logs};
use crate::engines::EngineRegistry;
use crate::models::{
    canonical_country, Algorithm, CauseAssignment, DroppedAlgorithm, Job, JobResult, JobStatus,
    LogEntry, OutputFile, RecordTable,
};
use crate::services::log_stream::{Diagnostics, LogStream, OutputBuffer, WARNING_PREFIX};
use crate::services::materializer::{
    assemble_result, register_files, MaterializeError, PipelineOutput, ResultMaterializer,
};
use crate::services::normalizer::{CategoryMatrix, CauseNormalizer, NormalizeError};
use crate::services::orchestrator::{
    label_fractions, AlgorithmOrchestrator, AlgorithmOutput, OrchestrateError, RunContext,
};

/// Column holding cause labels when a calibrate-only job names one algorithm
pub const CAUSE_COLUMN: &str = "cause";

/// Failure of a job's computation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job has no input records")]
    NoInput,

    #[error("Invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Classification(#[from] OrchestrateError),

    #[error("Cause normalization failed for {algorithm}: {source}")]
    Normalize {
        algorithm: Algorithm,
        #[source]
        source: NormalizeError,
    },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("Worker computation panicked: {0}")]
    Panicked(String),
}

/// How a worker run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed(String),
    /// The job was not Pending; nothing was done
    Skipped(JobStatus),
}

/// Dependencies of a worker
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: SqlitePool,
    pub config: Arc<ServiceConfig>,
    pub engines: EngineRegistry,
    pub calibration: Arc<dyn CalibrationEngine>,
    pub categorizer: Arc<dyn CauseCategorizer>,
}

impl WorkerContext {
    pub fn from_config(pool: SqlitePool, config: Arc<ServiceConfig>) -> Result<Self> {
        Ok(Self {
            engines: config.engine_registry()?,
            calibration: Arc::new(config.calibration_engine()?),
            categorizer: Arc::new(BroadCauseMap),
            pool,
            config,
        })
    }
}

/// Run job `job_id` if it is still Pending
pub async fn run_job(ctx: &WorkerContext, job_id: Uuid) -> Result<WorkerOutcome> {
    let mut job = jobs::load_job(&ctx.pool, job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

    if job.status != JobStatus::Pending {
        tracing::info!(job_id = %job_id, status = %job.status, "Job not pending, skipping");
        return Ok(WorkerOutcome::Skipped(job.status));
    }
    let claim = job.start().map_err(|e| Error::Internal(e.to_string()))?;
    if !jobs::save_transition(&ctx.pool, &job, &claim).await? {
        let status = jobs::load_status(&ctx.pool, job_id).await?.unwrap_or(claim.old_status);
        tracing::info!(job_id = %job_id, status = %status, "Job claimed elsewhere, skipping");
        return Ok(WorkerOutcome::Skipped(status));
    }
    tracing::info!(job_id = %job_id, job_type = %job.job_type, "Job running");

    let outcome = run_claimed(ctx, &job).await;
    finalize(&ctx.pool, job, outcome).await
}

/// Everything after the claim. Every error becomes the job's failure message,
/// so a claimed job always gets a terminal update.
async fn run_claimed(ctx: &WorkerContext, job: &Job) -> std::result::Result<JobResult, String> {
    let job_id = job.id;
    let stream = LogStream::start(
        ctx.pool.clone(),
        job_id,
        &ctx.config.scratch_path(job_id),
        ctx.config.log_poll_interval,
    )
    .map_err(|e| format!("Failed to start output capture: {}", e))?;

    let diagnostics = stream.diagnostics();
    diagnostics.info(format!(
        "Job started: {} with {} ({}, {})",
        job.job_type,
        job.parameters
            .algorithms
            .iter()
            .map(Algorithm::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        job.parameters.age_group,
        job.parameters.country
    ));

    let computation = JobComputation {
        job: job.clone(),
        job_dir: ctx.config.job_dir(job_id),
        engines: ctx.engines.clone(),
        calibration: Arc::clone(&ctx.calibration),
        categorizer: Arc::clone(&ctx.categorizer),
        output: stream.buffer(),
        diagnostics: diagnostics.clone(),
    };
    let computed = match tokio::task::spawn_blocking(move || computation.run()).await {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Panicked(e.to_string())),
    };

    let outcome = match computed {
        Ok((output, written)) => match register_files(&ctx.pool, job_id, &written).await {
            Ok(()) => Ok(assemble_result(job.job_type, &job.parameters, &output, written)),
            Err(e) => Err(format!("Failed to register output files: {}", e)),
        },
        Err(e) => Err(e.to_string()),
    };
    drop(diagnostics);

    if let Err(e) = stream.finish().await {
        tracing::error!(job_id = %job_id, error = %e, "Final log sweep failed");
    }
    outcome
}

/// Commit a log line outside the stream; the job's status matters more
async fn note(pool: &SqlitePool, job_id: Uuid, text: String) {
    if let Err(e) = logs::append_log(pool, job_id, &LogEntry::now(text)).await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to write job log");
    }
}

/// Write the closing log line, then the one terminal status update
async fn finalize(
    pool: &SqlitePool,
    mut job: Job,
    outcome: std::result::Result<JobResult, String>,
) -> Result<WorkerOutcome> {
    let job_id = job.id;
    let message = match outcome {
        Ok(result) => {
            note(pool, job_id, "Job completed".to_string()).await;
            let mut completed = job.clone();
            let transition = completed.complete(result).map_err(|e| Error::Internal(e.to_string()))?;
            match jobs::save_transition(pool, &completed, &transition).await {
                Ok(true) => {
                    tracing::info!(job_id = %job_id, "Job completed");
                    return Ok(WorkerOutcome::Completed);
                }
                Ok(false) => {
                    return Err(Error::Internal(format!("job {} left Running unexpectedly", job_id)));
                }
                Err(e) => format!("Failed to store job result: {}", e),
            }
        }
        Err(message) => message,
    };

    note(pool, job_id, format!("{}Job failed: {}", WARNING_PREFIX, message)).await;
    let transition = job.fail(message.as_str()).map_err(|e| Error::Internal(e.to_string()))?;
    if !jobs::save_transition(pool, &job, &transition).await? {
        return Err(Error::Internal(format!("job {} left Running unexpectedly", job_id)));
    }
    tracing::warn!(job_id = %job_id, error = %message, "Job failed");
    Ok(WorkerOutcome::Failed(message))
}

/// Owned state moved onto the blocking thread
struct JobComputation {
    job: Job,
    job_dir: PathBuf,
    engines: EngineRegistry,
    calibration: Arc<dyn CalibrationEngine>,
    categorizer: Arc<dyn CauseCategorizer>,
    output: Arc<OutputBuffer>,
    diagnostics: Diagnostics,
}

impl JobComputation {
    fn run(self) -> std::result::Result<(PipelineOutput, Vec<OutputFile>), PipelineError> {
        let records = self.job.input.as_ref().ok_or(PipelineError::NoInput)?;
        records.validate().map_err(|e| PipelineError::Input(e.to_string()))?;
        let params = &self.job.parameters;

        let mut output = if self.job.job_type.classifies() {
            let ctx = RunContext {
                job_id: self.job.id,
                age_group: params.age_group,
                scratch_dir: &self.job_dir,
                output: &self.output,
                diagnostics: &self.diagnostics,
            };
            let classified = AlgorithmOrchestrator::new(&self.engines).run(&ctx, records, &params.algorithms)?;
            PipelineOutput {
                algorithms: classified.outputs,
                dropped: classified.dropped,
                calibration: None,
            }
        } else {
            self.labels_from_input(records, &params.algorithms)?
        };

        if self.job.job_type.calibrates() {
            output.calibration = Some(self.calibrate(&output.algorithms)?);
        }

        self.line("Writing result tables");
        let written = ResultMaterializer::new(&self.job_dir).write_artifacts(self.job.job_type, &output)?;
        Ok((output, written))
    }

    fn line(&self, text: &str) {
        self.output.line(text);
    }

    /// Cause labels of a calibrate-only job, read from the input columns
    fn labels_from_input(
        &self,
        records: &RecordTable,
        algorithms: &[Algorithm],
    ) -> std::result::Result<PipelineOutput, PipelineError> {
        let ids = records.ids().map_err(|e| PipelineError::Input(e.to_string()))?;
        let mut output = PipelineOutput::default();

        for (i, &algorithm) in algorithms.iter().enumerate() {
            let column = records.column_index_ignore_case(algorithm.as_str()).or_else(|| {
                (algorithms.len() == 1)
                    .then(|| records.column_index_ignore_case(CAUSE_COLUMN))
                    .flatten()
            });

            let Some(column) = column else {
                let reason = format!("input has no cause column for {}", algorithm);
                if i == 0 {
                    return Err(PipelineError::Input(reason));
                }
                self.diagnostics.warn(format!("{} dropped: {}", algorithm, reason));
                output.dropped.push(DroppedAlgorithm { algorithm, reason });
                continue;
            };

            let assignments: Vec<CauseAssignment> = ids
                .iter()
                .zip(&records.rows)
                .map(|(id, row)| CauseAssignment::new(id.as_str(), row[column].as_str()))
                .collect();
            output.algorithms.push(AlgorithmOutput {
                algorithm,
                csmf: label_fractions(&assignments),
                assignments,
            });
        }
        Ok(output)
    }

    fn calibrate(&self, algorithms: &[AlgorithmOutput]) -> std::result::Result<crate::calibration::CalibrationOutput, PipelineError> {
        let params = &self.job.parameters;

        let country = match canonical_country(&params.country) {
            Some(country) => country.to_string(),
            None => {
                self.diagnostics.warn(format!(
                    "Unknown country '{}'; using priors for 'other'",
                    params.country
                ));
                "other".to_string()
            }
        };

        let normalizer = CauseNormalizer::new(self.categorizer.as_ref());
        let mut matrices: Vec<(Algorithm, CategoryMatrix)> = Vec::with_capacity(algorithms.len());
        for algo in algorithms {
            self.line(&format!("Normalizing causes for {}", algo.algorithm));
            let matrix = normalizer
                .normalize(params.age_group, &algo.assignments, &self.diagnostics)
                .map_err(|source| PipelineError::Normalize {
                    algorithm: algo.algorithm,
                    source,
                })?;
            matrices.push((algo.algorithm, matrix));
        }

        let ensemble = params.ensemble && matrices.len() >= 2;
        if params.ensemble && !ensemble {
            self.diagnostics.warn(format!(
                "Ensemble requested but only {} algorithm(s) remain; calibrating without ensemble",
                matrices.len()
            ));
        }

        self.line(&format!(
            "Calibrating {} algorithm(s) ({} iterations, burn-in {}, thin {})",
            matrices.len(),
            params.mcmc.n_mcmc,
            params.mcmc.n_burn,
            params.mcmc.n_thin
        ));
        let request = CalibrationRequest {
            inputs: matrices.iter().map(|(a, m)| (*a, m)).collect(),
            age_group: params.age_group,
            country,
            variant: params.calibration_variant,
            mcmc: params.mcmc,
            ensemble,
        };
        let calibrated = CalibrationStage::new(self.calibration.as_ref()).run(&request)?;
        self.line("Calibration complete");
        Ok(calibrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{GibbsEngine, JsonPriors};
    use crate::db::jobs::insert_job;
    use crate::models::{AgeGroup, CalibrationVariant, JobParameters, JobType, McmcParams};
    use crate::services::demo_data::demo_records;
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> WorkerContext {
        let pool = vacal_common::db::init_memory_database().await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        let mut config = ServiceConfig::for_data_dir(dir.path());
        config.log_poll_interval = std::time::Duration::from_millis(50);
        WorkerContext {
            pool,
            config: Arc::new(config),
            engines: EngineRegistry::with_demo_engines(),
            calibration: Arc::new(GibbsEngine::parametric(50.0)),
            categorizer: Arc::new(BroadCauseMap),
        }
    }

    fn params(algorithms: Vec<Algorithm>, ensemble: bool) -> JobParameters {
        JobParameters {
            algorithms,
            age_group: AgeGroup::Neonate,
            country: "Mozambique".to_string(),
            calibration_variant: CalibrationVariant::FullUncertainty,
            ensemble,
            mcmc: McmcParams {
                n_mcmc: 400,
                n_burn: 100,
                n_thin: 1,
                seed: 3,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_pipeline_completes_with_result_and_log() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::FullPipeline,
            params(vec![Algorithm::InterVa, Algorithm::InSilicoVa], true),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        assert_eq!(run_job(&ctx, job.id).await.unwrap(), WorkerOutcome::Completed);

        let stored = jobs::load_job(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.error.is_none());
        let result = stored.result.unwrap();
        assert!(result.ensemble);
        assert_eq!(result.calibrated_csmf.len(), 3);

        let log = logs::load_log_texts(&ctx.pool, job.id).await.unwrap();
        assert!(log.iter().any(|l| l.starts_with("Job started")));
        assert!(log.iter().any(|l| l == "Calibration complete"));
        assert!(log.iter().any(|l| l == "Job completed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_run_is_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::ClassifyOnly,
            params(vec![Algorithm::Eava], false),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        assert_eq!(run_job(&ctx, job.id).await.unwrap(), WorkerOutcome::Completed);
        assert_eq!(
            run_job(&ctx, job.id).await.unwrap(),
            WorkerOutcome::Skipped(JobStatus::Completed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_cause_column_fails_calibrate_only() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::CalibrateOnly,
            params(vec![Algorithm::InterVa], false),
            Some(RecordTable::from_csv("ID,label\n1,Prematurity\n").unwrap()),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        let outcome = run_job(&ctx, job.id).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(ref m) if m.contains("no cause column")));

        let stored = jobs::load_job(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.result.is_none());
        let log = logs::load_log_texts(&ctx.pool, job.id).await.unwrap();
        assert!(log.iter().any(|l| l.starts_with("WARNING: Job failed")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calibrate_only_reads_single_cause_column() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::CalibrateOnly,
            params(vec![Algorithm::InterVa], false),
            Some(RecordTable::from_csv("ID,cause\n1,Prematurity\n2,Birth asphyxia\n3,Sepsis\n").unwrap()),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        assert_eq!(run_job(&ctx, job.id).await.unwrap(), WorkerOutcome::Completed);
        let result = jobs::load_job(&ctx.pool, job.id).await.unwrap().unwrap().result.unwrap();
        assert_eq!(result.uncalibrated_csmf.len(), 1);
        assert_eq!(result.causes.len(), 6);
        assert!(result.files.iter().any(|f| f.name == "misclassification.csv"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        assert!(matches!(run_job(&ctx, Uuid::new_v4()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_line_follows_all_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::ClassifyOnly,
            params(vec![Algorithm::InterVa], false),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        assert_eq!(run_job(&ctx, job.id).await.unwrap(), WorkerOutcome::Completed);
        let log = logs::load_log_texts(&ctx.pool, job.id).await.unwrap();
        assert_eq!(log.last().map(String::as_str), Some("Job completed"));
        assert_eq!(log.iter().filter(|l| *l == "Job completed").count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unwritable_job_folder_fails_job() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::ClassifyOnly,
            params(vec![Algorithm::InterVa], false),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        // A plain file where the job folder should be
        let job_dir = ctx.config.job_dir(job.id);
        std::fs::create_dir_all(job_dir.parent().unwrap()).unwrap();
        std::fs::write(&job_dir, b"not a folder").unwrap();

        let outcome = run_job(&ctx, job.id).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(ref m) if m.contains("output capture")));

        let stored = jobs::load_job(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.completed_at.is_some());
        let log = logs::load_log_texts(&ctx.pool, job.id).await.unwrap();
        assert!(log.iter().any(|l| l.starts_with("WARNING: Job failed: Failed to start output capture")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_error_after_claim_fails_job() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let job = Job::new(
            JobType::ClassifyOnly,
            params(vec![Algorithm::InterVa], false),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();
        sqlx::query("DROP TABLE job_files").execute(&ctx.pool).await.unwrap();

        let outcome = run_job(&ctx, job.id).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(ref m) if m.contains("register output files")));
        assert_eq!(
            jobs::load_status(&ctx.pool, job.id).await.unwrap(),
            Some(JobStatus::Failed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_strict_prior_fails_as_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir).await;
        let priors = JsonPriors::from_json("{}").unwrap().strict(true);
        ctx.calibration = Arc::new(GibbsEngine::new(Arc::new(priors), 50.0));

        let job = Job::new(
            JobType::FullPipeline,
            params(vec![Algorithm::InterVa], false),
            Some(demo_records(AgeGroup::Neonate)),
        );
        insert_job(&ctx.pool, &job).await.unwrap();

        let outcome = run_job(&ctx, job.id).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(ref m) if m.contains("Calibration engine unavailable")));
        let stored = jobs::load_job(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.result.is_none());
    }
}
