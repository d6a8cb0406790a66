//! Job Launcher
//!
//! Starts one worker process per job:
//!
//! ```text
//! <worker_program> worker --job-id <id> --data-dir <dir> [--config <toml>]
//! ```
//!
//! Only the job id crosses the process boundary; the worker reads everything
//! else from the Job Store. The launcher does not wait for the worker. A
//! background task reaps the child and logs how it exited.
//!
//! If the process cannot be spawned, the job runs in the calling task instead,
//! so it never stays Pending.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;
use vacal_common::Result;

use crate::db::jobs;
use crate::models::JobStatus;
use crate::services::worker::{run_job, WorkerContext, WorkerOutcome};

/// How a job was started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// Worker process running in the background
    Spawned { pid: Option<u32> },
    /// Spawning failed; the job already ran to a terminal state here
    Inline(WorkerOutcome),
}

#[derive(Clone)]
pub struct JobLauncher {
    worker: WorkerContext,
}

impl JobLauncher {
    pub fn new(worker: WorkerContext) -> Self {
        Self { worker }
    }

    fn worker_program(&self) -> std::io::Result<PathBuf> {
        match &self.worker.config.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }

    /// Start the worker for a persisted Pending job
    pub async fn launch(&self, job_id: Uuid) -> Result<Launch> {
        match self.spawn_worker(job_id) {
            Ok(child) => {
                let pid = child.id();
                tracing::info!(job_id = %job_id, pid = ?pid, "Worker process started");
                tokio::spawn(reap(self.worker.clone(), job_id, child));
                Ok(Launch::Spawned { pid })
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    "Failed to spawn worker process, running job in-process"
                );
                let outcome = run_job(&self.worker, job_id).await?;
                Ok(Launch::Inline(outcome))
            }
        }
    }

    fn spawn_worker(&self, job_id: Uuid) -> std::io::Result<tokio::process::Child> {
        let program = self.worker_program()?;
        let config = &self.worker.config;

        std::fs::create_dir_all(config.job_dir(job_id))?;
        let stderr = std::fs::File::create(config.worker_log_path(job_id))?;

        let mut command = Command::new(&program);
        command
            .arg("worker")
            .arg("--job-id")
            .arg(job_id.to_string())
            .arg("--data-dir")
            .arg(&config.data_dir);
        if let Some(path) = &config.config_path {
            command.arg("--config").arg(path);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false)
            .spawn()
    }
}

/// Wait for a worker and log its exit.
///
/// A worker that exits without claiming its job (bad binary, crashed on start)
/// would leave it Pending, so the job is then run here.
async fn reap(worker: WorkerContext, job_id: Uuid, mut child: tokio::process::Child) {
    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::debug!(job_id = %job_id, "Worker process exited");
        }
        Ok(status) => {
            tracing::warn!(job_id = %job_id, status = %status, "Worker process exited with failure");
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to wait for worker process");
            return;
        }
    }

    match jobs::load_status(&worker.pool, job_id).await {
        Ok(Some(JobStatus::Pending)) => {
            tracing::warn!(job_id = %job_id, "Worker exited without claiming job, running in-process");
            if let Err(e) = run_job(&worker, job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "In-process run failed");
            }
        }
        Ok(Some(JobStatus::Running)) => {
            tracing::error!(
                job_id = %job_id,
                "Worker exited while job is Running; job stays Running until handled externally"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to check job after worker exit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::GibbsEngine;
    use crate::causes::BroadCauseMap;
    use crate::config::ServiceConfig;
    use crate::engines::EngineRegistry;
    use crate::models::{AgeGroup, Algorithm, CalibrationVariant, Job, JobParameters, JobType, McmcParams};
    use crate::services::demo_data::demo_records;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn worker(dir: &TempDir, program: &str) -> WorkerContext {
        let pool = crate::db::init_database_pool(&dir.path().join("vacal.db")).await.unwrap();
        let mut config = ServiceConfig::for_data_dir(dir.path());
        config.worker_program = Some(PathBuf::from(program));
        config.log_poll_interval = Duration::from_millis(50);
        WorkerContext {
            pool,
            config: Arc::new(config),
            engines: EngineRegistry::with_demo_engines(),
            calibration: Arc::new(GibbsEngine::parametric(50.0)),
            categorizer: Arc::new(BroadCauseMap),
        }
    }

    async fn pending_job(ctx: &WorkerContext) -> Uuid {
        let job = Job::new(
            JobType::ClassifyOnly,
            JobParameters {
                algorithms: vec![Algorithm::InterVa],
                age_group: AgeGroup::Child,
                country: "Kenya".to_string(),
                calibration_variant: CalibrationVariant::default(),
                ensemble: false,
                mcmc: McmcParams::default(),
            },
            Some(demo_records(AgeGroup::Child)),
        );
        jobs::insert_job(&ctx.pool, &job).await.unwrap();
        job.id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_runs_job_inline() {
        let dir = TempDir::new().unwrap();
        let ctx = worker(&dir, "/nonexistent/vacal-jobs").await;
        let id = pending_job(&ctx).await;

        let launch = JobLauncher::new(ctx.clone()).launch(id).await.unwrap();
        assert_eq!(launch, Launch::Inline(WorkerOutcome::Completed));
        assert_eq!(jobs::load_status(&ctx.pool, id).await.unwrap(), Some(JobStatus::Completed));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_that_never_claims_is_recovered() {
        let dir = TempDir::new().unwrap();
        // Exits successfully without touching the job
        let ctx = worker(&dir, "/bin/true").await;
        let id = pending_job(&ctx).await;

        let launch = JobLauncher::new(ctx.clone()).launch(id).await.unwrap();
        assert!(matches!(launch, Launch::Spawned { .. }));

        let mut status = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            status = jobs::load_status(&ctx.pool, id).await.unwrap();
            if status.is_some_and(|s| s.is_terminal()) {
                break;
            }
        }
        assert_eq!(status, Some(JobStatus::Completed));
    }
}
