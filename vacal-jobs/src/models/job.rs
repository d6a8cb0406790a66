//! Job lifecycle state machine
//!
//! PENDING → RUNNING → {COMPLETED, FAILED}
//!
//! Terminal states are final. A rerun is a new job carrying `rerun_of`, never a
//! transition of the original.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{JobParameters, JobResult, JobType, RecordTable};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The only legal edges: Pending→Running, Running→Completed, Running→Failed
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Applied status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// A submitted computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set iff status is Failed
    pub error: Option<String>,
    /// Set iff status is Completed
    pub result: Option<JobResult>,
    /// Job this one was cloned from
    pub rerun_of: Option<Uuid>,
    /// Retained input records
    #[serde(skip)]
    pub input: Option<RecordTable>,
}

impl Job {
    /// Create a new Pending job
    pub fn new(job_type: JobType, parameters: JobParameters, input: Option<RecordTable>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            parameters,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            rerun_of: None,
            input,
        }
    }

    /// New Pending job with this job's parameters and input
    pub fn rerun(&self) -> Self {
        let mut job = Job::new(self.job_type, self.parameters.clone(), self.input.clone());
        job.rerun_of = Some(self.id);
        job
    }

    fn transition_to(&mut self, new_status: JobStatus) -> Result<StateTransition, TransitionError> {
        if !self.status.can_transition_to(new_status) {
            return Err(TransitionError {
                from: self.status,
                to: new_status,
            });
        }

        let transition = StateTransition {
            job_id: self.id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;
        Ok(transition)
    }

    /// Pending → Running
    pub fn start(&mut self) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Running)?;
        self.started_at = Some(transition.transitioned_at);
        Ok(transition)
    }

    /// Running → Completed, attaching the result
    pub fn complete(&mut self, result: JobResult) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Completed)?;
        self.completed_at = Some(transition.transitioned_at);
        self.result = Some(result);
        self.error = None;
        Ok(transition)
    }

    /// Running → Failed, recording the error
    pub fn fail(&mut self, error: impl Into<String>) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Failed)?;
        self.completed_at = Some(transition.transitioned_at);
        self.error = Some(error.into());
        self.result = None;
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Row of `list_jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgeGroup, Algorithm, CalibrationVariant, McmcParams};

    fn params() -> JobParameters {
        JobParameters {
            algorithms: vec![Algorithm::InterVa],
            age_group: AgeGroup::Neonate,
            country: "Mozambique".to_string(),
            calibration_variant: CalibrationVariant::FullUncertainty,
            ensemble: false,
            mcmc: McmcParams::default(),
        }
    }

    fn job() -> Job {
        Job::new(JobType::FullPipeline, params(), None)
    }

    #[test]
    fn new_job_is_pending_with_created_at_only() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.error.is_none() && job.result.is_none());
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let mut job = job();
        let t = job.start().unwrap();
        assert_eq!(t.old_status, JobStatus::Pending);
        assert!(job.started_at.is_some());

        job.complete(JobResult::empty(JobType::FullPipeline, &params())).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_sets_error_only() {
        let mut job = job();
        job.start().unwrap();
        job.fail("engine exploded").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("engine exploded"));
        assert!(job.result.is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = job();
        job.start().unwrap();
        job.fail("boom").unwrap();

        assert!(job.start().is_err());
        assert!(job.complete(JobResult::empty(JobType::FullPipeline, &params())).is_err());
        assert!(job.fail("again").is_err());
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_cannot_skip_running() {
        let mut job = job();
        let err = job.fail("too early").unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Failed);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn rerun_is_new_pending_job_with_back_reference() {
        let mut original = job();
        original.start().unwrap();
        original.fail("x").unwrap();

        let rerun = original.rerun();
        assert_ne!(rerun.id, original.id);
        assert_eq!(rerun.status, JobStatus::Pending);
        assert_eq!(rerun.rerun_of, Some(original.id));
        assert_eq!(rerun.parameters, original.parameters);
        assert_eq!(original.status, JobStatus::Failed);
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }
}
