//! Job submission and queries
//!
//! The contract the HTTP layer is built on. Submission validates everything up
//! front: a request that fails validation never creates a job. Queries only
//! read the Job Store.

use std::collections::BTreeMap;

use serde::Deserialize;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;
use vacal_common::Error;

use crate::db::{files, jobs, logs};
use crate::models::{
    AgeGroup, Algorithm, CalibrationVariant, Job, JobParameters, JobResult, JobStatus, JobSummary,
    JobType, LogEntry, McmcParams, OutputFile, RecordTable,
};
use crate::services::demo_data::{demo_cause_table, demo_records};
use crate::services::launcher::{JobLauncher, Launch};
use crate::services::worker::CAUSE_COLUMN;

/// Submission rejected before any job was created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0}")]
    UnknownJobType(String),

    #[error("{0}")]
    UnknownAlgorithm(String),

    #[error("{0}")]
    UnknownAgeGroup(String),

    #[error("{0}")]
    UnknownCalibrationVariant(String),

    #[error("At least one algorithm is required")]
    NoAlgorithms,

    #[error("Algorithm {0} listed more than once")]
    DuplicateAlgorithm(Algorithm),

    #[error("Ensemble calibration needs at least 2 algorithms, got {0}")]
    EnsembleTooSmall(usize),

    #[error("Invalid MCMC parameters: {0}")]
    Mcmc(String),

    #[error("Invalid input: {0}")]
    Input(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Output file not found: {0}")]
    FileNotFound(String),

    #[error("Job {0} has no retained input to rerun")]
    NoRetainedInput(Uuid),

    #[error(transparent)]
    Store(#[from] Error),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Input records as submitted
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputPayload {
    /// `{ "columns": [...], "rows": [[...], ...] }`
    Table(RecordTable),
    /// CSV text with a header row
    Csv(String),
}

impl InputPayload {
    fn into_table(self) -> Result<RecordTable, ValidationError> {
        let table = match self {
            InputPayload::Table(table) => table,
            InputPayload::Csv(text) => {
                RecordTable::from_csv(&text).map_err(|e| ValidationError::Input(e.to_string()))?
            }
        };
        table.validate().map_err(|e| ValidationError::Input(e.to_string()))?;
        if table.is_empty() {
            return Err(ValidationError::Input("input has no records".to_string()));
        }
        Ok(table)
    }
}

/// Unvalidated submission, as received from a client
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(default = "default_job_type", alias = "type")]
    pub job_type: String,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,
    #[serde(default = "default_age_group")]
    pub age_group: String,
    #[serde(default = "default_country", alias = "region")]
    pub country: String,
    #[serde(default)]
    pub calibration_variant: Option<String>,
    #[serde(default)]
    pub ensemble: bool,
    #[serde(default)]
    pub mcmc: McmcParams,
    #[serde(default)]
    pub input: Option<InputPayload>,
}

fn default_job_type() -> String {
    JobType::FullPipeline.as_str().to_string()
}

fn default_algorithms() -> Vec<String> {
    vec![Algorithm::InterVa.as_str().to_string()]
}

fn default_age_group() -> String {
    AgeGroup::Neonate.as_str().to_string()
}

fn default_country() -> String {
    "Mozambique".to_string()
}

impl Default for SubmitRequest {
    fn default() -> Self {
        Self {
            job_type: default_job_type(),
            algorithms: default_algorithms(),
            age_group: default_age_group(),
            country: default_country(),
            calibration_variant: None,
            ensemble: false,
            mcmc: McmcParams::default(),
            input: None,
        }
    }
}

/// Submission that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    pub job_type: JobType,
    pub parameters: JobParameters,
    pub input: Option<RecordTable>,
}

impl SubmitRequest {
    pub fn validate(self) -> Result<ValidatedSubmission, ValidationError> {
        let job_type: JobType = self.job_type.parse().map_err(ValidationError::UnknownJobType)?;

        let mut algorithms: Vec<Algorithm> = Vec::with_capacity(self.algorithms.len());
        for name in &self.algorithms {
            let algorithm: Algorithm = name.parse().map_err(ValidationError::UnknownAlgorithm)?;
            if algorithms.contains(&algorithm) {
                return Err(ValidationError::DuplicateAlgorithm(algorithm));
            }
            algorithms.push(algorithm);
        }
        if algorithms.is_empty() {
            return Err(ValidationError::NoAlgorithms);
        }
        if self.ensemble && algorithms.len() < 2 {
            return Err(ValidationError::EnsembleTooSmall(algorithms.len()));
        }

        let age_group: AgeGroup = self.age_group.parse().map_err(ValidationError::UnknownAgeGroup)?;
        let calibration_variant = match self.calibration_variant.as_deref() {
            Some(name) => name.parse().map_err(ValidationError::UnknownCalibrationVariant)?,
            None => CalibrationVariant::default(),
        };
        self.mcmc.validate().map_err(ValidationError::Mcmc)?;

        let input = self.input.map(InputPayload::into_table).transpose()?;
        if let (JobType::CalibrateOnly, Some(table)) = (job_type, &input) {
            let primary = algorithms[0];
            let has_labels = table.column_index_ignore_case(primary.as_str()).is_some()
                || (algorithms.len() == 1 && table.column_index_ignore_case(CAUSE_COLUMN).is_some());
            if !has_labels {
                return Err(ValidationError::Input(format!(
                    "calibrate-only input needs a '{}' column",
                    if algorithms.len() == 1 { CAUSE_COLUMN } else { primary.as_str() }
                )));
            }
        }

        Ok(ValidatedSubmission {
            job_type,
            parameters: JobParameters {
                algorithms,
                age_group,
                country: self.country.trim().to_string(),
                calibration_variant,
                ensemble: self.ensemble,
                mcmc: self.mcmc,
            },
            input,
        })
    }
}

/// Returned by submit and rerun
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Outcome of a results query
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsView {
    Ready(JobResult),
    NotReady { status: JobStatus, error: Option<String> },
}

#[derive(Clone)]
pub struct JobService {
    pool: SqlitePool,
    launcher: JobLauncher,
}

impl JobService {
    pub fn new(pool: SqlitePool, launcher: JobLauncher) -> Self {
        Self { pool, launcher }
    }

    /// Validate, persist as Pending, and launch.
    ///
    /// Without input the job runs on the sample dataset, which is stored with
    /// the job.
    pub async fn submit(&self, request: SubmitRequest) -> ServiceResult<SubmitResponse> {
        let submission = request.validate()?;
        let input = match submission.input {
            Some(table) => table,
            None => sample_input(submission.job_type, &submission.parameters)?,
        };

        let job = Job::new(submission.job_type, submission.parameters, Some(input));
        jobs::insert_job(&self.pool, &job).await?;
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            records = job.input.as_ref().map(RecordTable::len).unwrap_or(0),
            "Job submitted"
        );

        self.start(job.id).await
    }

    /// Submit a job on the sample dataset, ignoring any supplied input
    pub async fn submit_demo(&self, mut request: SubmitRequest) -> ServiceResult<SubmitResponse> {
        request.input = None;
        self.submit(request).await
    }

    async fn start(&self, job_id: Uuid) -> ServiceResult<SubmitResponse> {
        let status = match self.launcher.launch(job_id).await {
            Ok(Launch::Spawned { .. }) => JobStatus::Pending,
            Ok(Launch::Inline(_)) => self.current_status(job_id).await?,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job launch failed");
                self.current_status(job_id).await?
            }
        };
        Ok(SubmitResponse { job_id, status })
    }

    async fn current_status(&self, job_id: Uuid) -> ServiceResult<JobStatus> {
        jobs::load_status(&self.pool, job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))
    }

    async fn job(&self, job_id: Uuid) -> ServiceResult<Job> {
        jobs::load_job(&self.pool, job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))
    }

    /// Full job record (result and input stripped by the caller as needed)
    pub async fn get_status(&self, job_id: Uuid) -> ServiceResult<Job> {
        self.job(job_id).await
    }

    pub async fn get_log(&self, job_id: Uuid) -> ServiceResult<Vec<LogEntry>> {
        self.current_status(job_id).await?;
        Ok(logs::load_log(&self.pool, job_id).await?)
    }

    pub async fn get_results(&self, job_id: Uuid) -> ServiceResult<ResultsView> {
        let job = self.job(job_id).await?;
        Ok(match (job.status, job.result) {
            (JobStatus::Completed, Some(result)) => ResultsView::Ready(result),
            (status, _) => ResultsView::NotReady {
                status,
                error: job.error,
            },
        })
    }

    /// Bytes of a registered output file
    pub async fn download(&self, job_id: Uuid, name: &str) -> ServiceResult<(OutputFile, Vec<u8>)> {
        self.current_status(job_id).await?;
        let file = files::find_file(&self.pool, job_id, name)
            .await?
            .ok_or_else(|| ServiceError::FileNotFound(name.to_string()))?;
        let bytes = tokio::fs::read(&file.location).await.map_err(Error::Io)?;
        Ok((file, bytes))
    }

    /// New Pending job with the parameters and retained input of `job_id`
    pub async fn rerun(&self, job_id: Uuid) -> ServiceResult<SubmitResponse> {
        let original = self.job(job_id).await?;
        if original.input.is_none() {
            return Err(ServiceError::NoRetainedInput(job_id));
        }

        let job = original.rerun();
        jobs::insert_job(&self.pool, &job).await?;
        tracing::info!(job_id = %job.id, rerun_of = %job_id, "Job resubmitted");

        self.start(job.id).await
    }

    /// Job counts keyed by status name; statuses with no jobs report zero
    pub async fn status_counts(&self) -> ServiceResult<BTreeMap<&'static str, i64>> {
        let mut counts: BTreeMap<&'static str, i64> = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .iter()
        .map(|s| (s.as_str(), 0))
        .collect();
        for (status, n) in jobs::count_by_status(&self.pool).await? {
            counts.insert(status.as_str(), n);
        }
        Ok(counts)
    }

    pub async fn list_jobs(&self) -> ServiceResult<Vec<JobSummary>> {
        Ok(jobs::list_jobs(&self.pool).await?)
    }
}

fn sample_input(job_type: JobType, params: &JobParameters) -> ServiceResult<RecordTable> {
    if job_type.classifies() {
        return Ok(demo_records(params.age_group));
    }
    demo_cause_table(params.age_group, &params.algorithms)
        .map_err(|e| ServiceError::Store(Error::Internal(format!("sample input: {}", e))))
}
