//! Output file registry

use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use vacal_common::time::{now, to_db_string};
use vacal_common::Result;

use crate::models::OutputFile;
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Register an artifact. Registration is write-once: a second
/// registration under the same name is ignored.
pub async fn register_file(pool: &SqlitePool, job_id: Uuid, file: &OutputFile) -> Result<()> {
    let id = job_id.to_string();
    let created_at = to_db_string(&now());
    let size = file.size_bytes as i64;

    retry_on_lock("register_file", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_files (job_id, name, location, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&file.name)
        .bind(&file.location)
        .bind(size)
        .bind(&created_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> OutputFile {
    let size: i64 = row.get("size_bytes");
    OutputFile {
        name: row.get("name"),
        location: row.get("location"),
        size_bytes: size.max(0) as u64,
    }
}

/// Registered artifacts of a job in registration order
pub async fn list_files(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<OutputFile>> {
    let rows = sqlx::query(
        "SELECT name, location, size_bytes FROM job_files WHERE job_id = ? ORDER BY created_at, rowid",
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_file).collect())
}

pub async fn find_file(pool: &SqlitePool, job_id: Uuid, name: &str) -> Result<Option<OutputFile>> {
    let row = sqlx::query("SELECT name, location, size_bytes FROM job_files WHERE job_id = ? AND name = ?")
        .bind(job_id.to_string())
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(row_to_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::jobs::insert_job;
    use crate::models::{AgeGroup, Algorithm, CalibrationVariant, Job, JobParameters, JobType, McmcParams};

    async fn setup() -> (SqlitePool, Uuid) {
        let pool = vacal_common::db::init_memory_database().await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        let job = Job::new(
            JobType::FullPipeline,
            JobParameters {
                algorithms: vec![Algorithm::Eava],
                age_group: AgeGroup::Child,
                country: "other".to_string(),
                calibration_variant: CalibrationVariant::Fixed,
                ensemble: false,
                mcmc: McmcParams::default(),
            },
            None,
        );
        insert_job(&pool, &job).await.unwrap();
        (pool, job.id)
    }

    fn file(name: &str, size: u64) -> OutputFile {
        OutputFile {
            name: name.to_string(),
            location: format!("/tmp/{}", name),
            size_bytes: size,
        }
    }

    #[tokio::test]
    async fn register_then_find() {
        let (pool, id) = setup().await;
        register_file(&pool, id, &file("calibrated_csmf.csv", 120)).await.unwrap();
        register_file(&pool, id, &file("misclassification.csv", 300)).await.unwrap();

        let files = list_files(&pool, id).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "calibrated_csmf.csv");

        let found = find_file(&pool, id, "misclassification.csv").await.unwrap().unwrap();
        assert_eq!(found.size_bytes, 300);
        assert!(find_file(&pool, id, "nope.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registration_is_write_once() {
        let (pool, id) = setup().await;
        register_file(&pool, id, &file("a.csv", 1)).await.unwrap();
        register_file(&pool, id, &file("a.csv", 999)).await.unwrap();

        let found = find_file(&pool, id, "a.csv").await.unwrap().unwrap();
        assert_eq!(found.size_bytes, 1);
        assert_eq!(list_files(&pool, id).await.unwrap().len(), 1);
    }
}
