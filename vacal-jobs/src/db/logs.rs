//! Append-only job log

use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use vacal_common::time::{from_db_string, to_db_string};
use vacal_common::Result;

use crate::models::LogEntry;
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Append a single log line
pub async fn append_log(pool: &SqlitePool, job_id: Uuid, entry: &LogEntry) -> Result<()> {
    append_logs(pool, job_id, std::slice::from_ref(entry)).await
}

/// Append a batch of log lines in order, atomically
pub async fn append_logs(pool: &SqlitePool, job_id: Uuid, entries: &[LogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let id = job_id.to_string();
    let rows: Vec<(String, &str)> = entries
        .iter()
        .map(|e| (to_db_string(&e.timestamp), e.text.as_str()))
        .collect();

    retry_on_lock("append_logs", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (logged_at, text) in &rows {
            sqlx::query("INSERT INTO job_logs (job_id, logged_at, text) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(logged_at)
                .bind(*text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// All log lines of a job in append order
pub async fn load_log(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<LogEntry>> {
    let rows = sqlx::query("SELECT logged_at, text FROM job_logs WHERE job_id = ? ORDER BY seq")
        .bind(job_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let logged_at: String = row.get("logged_at");
            Ok(LogEntry {
                timestamp: from_db_string(&logged_at)?,
                text: row.get("text"),
            })
        })
        .collect()
}

/// Text of every committed line, in append order
pub async fn load_log_texts(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<String>> {
    let texts = sqlx::query_scalar("SELECT text FROM job_logs WHERE job_id = ? ORDER BY seq")
        .bind(job_id.to_string())
        .fetch_all(pool)
        .await?;
    Ok(texts)
}
