//! Job record persistence
//!
//! Status changes are conditional updates (`WHERE status = ?`), so the store
//! itself refuses illegal transitions even when several processes race.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use vacal_common::time::{from_db_string, to_db_string};
use vacal_common::{Error, Result};

use crate::models::{
    Job, JobParameters, JobResult, JobStatus, JobSummary, JobType, RecordTable, StateTransition,
};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", what, e)))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", what, e)))
}

fn parse_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db_string).transpose()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid job id '{}': {}", value, e)))
}

fn parse_job_type(value: &str) -> Result<JobType> {
    value.parse::<JobType>().map_err(Error::Internal)
}

fn parse_status(value: &str) -> Result<JobStatus> {
    JobStatus::parse(value).ok_or_else(|| Error::Internal(format!("Unknown job status '{}'", value)))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let parameters: String = row.get("parameters");
    let input: Option<String> = row.get("input");
    let created_at: String = row.get("created_at");
    let result: Option<String> = row.get("result");
    let rerun_of: Option<String> = row.get("rerun_of");

    Ok(Job {
        id: parse_uuid(&id)?,
        job_type: parse_job_type(&job_type)?,
        status: parse_status(&status)?,
        parameters: from_json::<JobParameters>(&parameters, "parameters")?,
        created_at: from_db_string(&created_at)?,
        started_at: parse_optional_ts(row.get("started_at"))?,
        completed_at: parse_optional_ts(row.get("completed_at"))?,
        error: row.get("error"),
        result: result
            .as_deref()
            .map(|r| from_json::<JobResult>(r, "result"))
            .transpose()?,
        rerun_of: rerun_of.as_deref().map(parse_uuid).transpose()?,
        input: input
            .as_deref()
            .map(|i| from_json::<RecordTable>(i, "input"))
            .transpose()?,
    })
}

/// Persist a newly created job
pub async fn insert_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    let id = job.id.to_string();
    let parameters = to_json(&job.parameters, "parameters")?;
    let input = job.input.as_ref().map(|i| to_json(i, "input")).transpose()?;
    let created_at = to_db_string(&job.created_at);
    let rerun_of = job.rerun_of.map(|r| r.to_string());

    retry_on_lock("insert_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, parameters, input, created_at, rerun_of)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(&parameters)
        .bind(&input)
        .bind(&created_at)
        .bind(&rerun_of)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Load a job including its retained input
pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"
        SELECT id, job_type, status, parameters, input, created_at, started_at,
               completed_at, error, result, rerun_of
        FROM jobs
        WHERE id = ?
        "#,
    )
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Current status only
pub async fn load_status(pool: &SqlitePool, job_id: Uuid) -> Result<Option<JobStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    status.as_deref().map(parse_status).transpose()
}

/// Summaries of all known jobs, newest first
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<JobSummary>> {
    let rows = sqlx::query("SELECT id, job_type, status, created_at FROM jobs ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let job_type: String = row.get("job_type");
            let status: String = row.get("status");
            let created_at: String = row.get("created_at");
            Ok(JobSummary {
                id: parse_uuid(&id)?,
                job_type: parse_job_type(&job_type)?,
                status: parse_status(&status)?,
                created_at: from_db_string(&created_at)?,
            })
        })
        .collect()
}

/// Number of jobs in each status
pub async fn count_by_status(pool: &SqlitePool) -> Result<Vec<(JobStatus, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let status: String = row.get("status");
            Ok((parse_status(&status)?, row.get::<i64, _>("n")))
        })
        .collect()
}

/// Persist a status change made on the model by [`Job::start`],
/// [`Job::complete`] or [`Job::fail`].
///
/// The update only applies while the stored status is still the transition's
/// old status, so of two racing workers exactly one wins. Returns false for
/// the loser.
pub async fn save_transition(pool: &SqlitePool, job: &Job, transition: &StateTransition) -> Result<bool> {
    if transition.job_id != job.id
        || transition.new_status != job.status
        || !transition.old_status.can_transition_to(transition.new_status)
    {
        return Err(Error::Internal(format!(
            "Transition {} -> {} does not match job {} ({})",
            transition.old_status, transition.new_status, job.id, job.status
        )));
    }

    let id = job.id.to_string();
    let started_at = job.started_at.as_ref().map(to_db_string);
    let completed_at = job.completed_at.as_ref().map(to_db_string);
    let result = job.result.as_ref().map(|r| to_json(r, "result")).transpose()?;

    retry_on_lock("save_transition", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, started_at = ?, completed_at = ?, error = ?, result = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(transition.new_status.as_str())
        .bind(&started_at)
        .bind(&completed_at)
        .bind(&job.error)
        .bind(&result)
        .bind(&id)
        .bind(transition.old_status.as_str())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgeGroup, Algorithm, CalibrationVariant, McmcParams};

    async fn pool() -> SqlitePool {
        let pool = vacal_common::db::init_memory_database().await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn job() -> Job {
        Job::new(
            JobType::CalibrateOnly,
            JobParameters {
                algorithms: vec![Algorithm::InterVa, Algorithm::Eava],
                age_group: AgeGroup::Child,
                country: "Kenya".to_string(),
                calibration_variant: CalibrationVariant::Fixed,
                ensemble: true,
                mcmc: McmcParams::default(),
            },
            Some(RecordTable::from_csv("ID,InterVA,EAVA\na,Malaria,Malaria\n").unwrap()),
        )
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let pool = pool().await;
        let job = job();
        insert_job(&pool, &job).await.unwrap();

        let loaded = load_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.job_type, JobType::CalibrateOnly);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.parameters, job.parameters);
        assert_eq!(loaded.input, job.input);
        assert_eq!(loaded.created_at.timestamp_micros(), job.created_at.timestamp_micros());
    }

    #[tokio::test]
    async fn unknown_job_loads_as_none() {
        let pool = pool().await;
        assert!(load_job(&pool, Uuid::new_v4()).await.unwrap().is_none());
        assert!(load_status(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let pool = pool().await;
        let job = job();
        insert_job(&pool, &job).await.unwrap();

        let mut first = job.clone();
        let mut second = job.clone();
        let t1 = first.start().unwrap();
        let t2 = second.start().unwrap();
        assert!(save_transition(&pool, &first, &t1).await.unwrap());
        assert!(!save_transition(&pool, &second, &t2).await.unwrap());

        let loaded = load_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn terminal_update_applies_once() {
        let pool = pool().await;
        let mut job = job();
        insert_job(&pool, &job).await.unwrap();
        let claim = job.start().unwrap();
        save_transition(&pool, &job, &claim).await.unwrap();

        let mut stale = job.clone();
        let failed = job.fail("boom").unwrap();
        assert!(save_transition(&pool, &job, &failed).await.unwrap());

        // Failed is final
        let completed = stale.complete(JobResult::empty(job.job_type, &job.parameters)).unwrap();
        assert!(!save_transition(&pool, &stale, &completed).await.unwrap());

        let loaded = load_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(loaded.result.is_none());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let pool = pool().await;
        let mut job = job();
        insert_job(&pool, &job).await.unwrap();

        // Pending straight to Failed, built by hand
        job.status = JobStatus::Failed;
        job.error = Some("early".to_string());
        let transition = StateTransition {
            job_id: job.id,
            old_status: JobStatus::Pending,
            new_status: JobStatus::Failed,
            transitioned_at: Utc::now(),
        };
        assert!(matches!(
            save_transition(&pool, &job, &transition).await,
            Err(Error::Internal(_))
        ));
        assert_eq!(load_status(&pool, job.id).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn completion_stores_result() {
        let pool = pool().await;
        let mut job = job();
        insert_job(&pool, &job).await.unwrap();
        let claim = job.start().unwrap();
        save_transition(&pool, &job, &claim).await.unwrap();

        let mut result = JobResult::empty(job.job_type, &job.parameters);
        result.algorithms = vec![Algorithm::InterVa];
        let completed = job.complete(result.clone()).unwrap();
        assert!(save_transition(&pool, &job, &completed).await.unwrap());

        let loaded = load_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.result, Some(result));
        assert!(loaded.error.is_none());
        assert!(loaded.started_at.is_some() && loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let pool = pool().await;
        let first = job();
        insert_job(&pool, &first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = first.rerun();
        insert_job(&pool, &second).await.unwrap();

        let listed = list_jobs(&pool).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let loaded = load_job(&pool, second.id).await.unwrap().unwrap();
        assert_eq!(loaded.rerun_of, Some(first.id));
    }
}
