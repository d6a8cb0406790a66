//! Job Store
//!
//! SQLite tables shared by the API process and the worker processes:
//! - `jobs`: identity, parameters, status, timestamps, error, result, retained input
//! - `job_logs`: append-only log lines, ordered by `seq`
//! - `job_files`: registered output artifacts
//!
//! Writers only issue narrow statements (conditional status update, log append,
//! file append); readers never write.

pub mod files;
pub mod jobs;
pub mod logs;

use sqlx::SqlitePool;
use std::path::Path;
use vacal_common::Result;

/// Open the Job Store at `db_path`, creating tables if needed
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = vacal_common::db::init_database(db_path).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create Job Store tables (idempotent)
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL,
            parameters TEXT NOT NULL,
            input TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            result TEXT,
            rerun_of TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES jobs(id),
            logged_at TEXT NOT NULL,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, seq)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_files (
            job_id TEXT NOT NULL REFERENCES jobs(id),
            name TEXT NOT NULL,
            location TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (job_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Job Store tables initialized (jobs, job_logs, job_files)");

    Ok(())
}
