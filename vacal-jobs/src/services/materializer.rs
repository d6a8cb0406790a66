//! Result Materializer
//!
//! Writes a job's tables as CSV artifacts under its job folder, registers each
//! one as an output file, and assembles the structured result payload.
//!
//! Artifacts:
//! - `causes_<algorithm>.csv`: per-record cause, for jobs that classify
//! - `classification_csmf.csv`: uncalibrated fraction per free-text label
//! - `calibrated_csmf.csv`: uncalibrated and calibrated fractions per row label and cause
//! - `misclassification.csv`, or `misclassification_<algorithm>.csv` when several
//!   algorithms were calibrated

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::calibration::CalibrationOutput;
use crate::db::files;
use crate::models::{
    CalibratedRow, ClassificationSummary, CsmfRow, DroppedAlgorithm, JobParameters, JobResult, JobType,
    MisclassificationRow, MisclassificationTable, OutputFile, ID_COLUMN,
};
use crate::services::orchestrator::AlgorithmOutput;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Failed to write artifact: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a job computed
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// Surviving algorithms with their cause assignments
    pub algorithms: Vec<AlgorithmOutput>,
    pub dropped: Vec<DroppedAlgorithm>,
    pub calibration: Option<CalibrationOutput>,
}

/// Flatten each calibrated algorithm's matrix into a true × predicted table
pub fn misclassification_tables(calibration: &CalibrationOutput) -> Vec<MisclassificationTable> {
    let qualified = calibration.misclassification.len() > 1;
    let mut header = vec!["true_cause".to_string()];
    header.extend(calibration.causes.iter().cloned());

    calibration
        .misclassification
        .iter()
        .map(|(algorithm, matrix)| MisclassificationTable {
            name: if qualified {
                format!("misclassification_{}", algorithm)
            } else {
                "misclassification".to_string()
            },
            algorithm: algorithm.to_string(),
            header: header.clone(),
            rows: calibration
                .causes
                .iter()
                .zip(matrix)
                .map(|(cause, values)| MisclassificationRow {
                    true_cause: cause.clone(),
                    values: values.clone(),
                })
                .collect(),
        })
        .collect()
}

pub struct ResultMaterializer {
    job_dir: PathBuf,
}

impl ResultMaterializer {
    pub fn new(job_dir: &Path) -> Self {
        Self {
            job_dir: job_dir.to_path_buf(),
        }
    }

    /// Write every artifact for `output`, returning them in write order
    pub fn write_artifacts(&self, job_type: JobType, output: &PipelineOutput) -> Result<Vec<OutputFile>, MaterializeError> {
        std::fs::create_dir_all(&self.job_dir)?;
        let mut written = Vec::new();

        if job_type.classifies() {
            for algo in &output.algorithms {
                let name = format!("causes_{}.csv", algo.algorithm);
                let mut rows = vec![vec![ID_COLUMN.to_string(), "cause".to_string()]];
                rows.extend(algo.assignments.iter().map(|a| vec![a.id.clone(), a.cause.clone()]));
                written.push(self.write_csv(&name, &rows)?);
            }
        }

        if !output.algorithms.is_empty() {
            let mut rows = vec![vec!["algorithm".to_string(), "label".to_string(), "fraction".to_string()]];
            for algo in &output.algorithms {
                for (label, fraction) in &algo.csmf {
                    rows.push(vec![algo.algorithm.to_string(), label.clone(), fraction.to_string()]);
                }
            }
            written.push(self.write_csv("classification_csmf.csv", &rows)?);
        }

        if let Some(calibration) = &output.calibration {
            let mut rows = vec![["label", "cause", "uncalibrated", "mean", "low", "high"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()];
            for summary in &calibration.calibrated {
                let uncalibrated = calibration
                    .uncalibrated
                    .iter()
                    .find(|(label, _)| *label == summary.label)
                    .map(|(_, values)| values.as_slice())
                    .unwrap_or(&[]);
                for (k, cause) in calibration.causes.iter().enumerate() {
                    rows.push(vec![
                        summary.label.clone(),
                        cause.clone(),
                        uncalibrated.get(k).map(f64::to_string).unwrap_or_default(),
                        summary.mean[k].to_string(),
                        summary.low[k].to_string(),
                        summary.high[k].to_string(),
                    ]);
                }
            }
            written.push(self.write_csv("calibrated_csmf.csv", &rows)?);

            for table in misclassification_tables(calibration) {
                let mut rows = vec![table.header.clone()];
                for row in &table.rows {
                    let mut r = vec![row.true_cause.clone()];
                    r.extend(row.values.iter().map(f64::to_string));
                    rows.push(r);
                }
                written.push(self.write_csv(&format!("{}.csv", table.name), &rows)?);
            }
        }

        Ok(written)
    }

    fn write_csv(&self, name: &str, rows: &[Vec<String>]) -> Result<OutputFile, MaterializeError> {
        let path = self.job_dir.join(name);
        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        drop(writer);

        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(OutputFile {
            name: name.to_string(),
            location: path.to_string_lossy().into_owned(),
            size_bytes,
        })
    }
}

/// Record artifacts in the Job Store
pub async fn register_files(pool: &SqlitePool, job_id: Uuid, written: &[OutputFile]) -> vacal_common::Result<()> {
    for file in written {
        files::register_file(pool, job_id, file).await?;
        tracing::debug!(job_id = %job_id, file = %file.name, size = file.size_bytes, "Registered output file");
    }
    Ok(())
}

/// Structured payload attached to the completed job
pub fn assemble_result(
    job_type: JobType,
    params: &JobParameters,
    output: &PipelineOutput,
    written: Vec<OutputFile>,
) -> JobResult {
    let mut result = JobResult::empty(job_type, params);
    result.algorithms = output.algorithms.iter().map(|a| a.algorithm).collect();
    result.dropped_algorithms = output.dropped.clone();
    result.classification = output
        .algorithms
        .iter()
        .map(|a| ClassificationSummary {
            algorithm: a.algorithm,
            records: a.assignments.len(),
            csmf: a.csmf.clone(),
        })
        .collect();

    if let Some(calibration) = &output.calibration {
        result.ensemble = calibration.ensemble;
        result.causes = calibration.causes.clone();
        result.uncalibrated_csmf = calibration
            .uncalibrated
            .iter()
            .map(|(label, values)| CsmfRow {
                label: label.clone(),
                values: values.clone(),
            })
            .collect();
        result.calibrated_csmf = calibration
            .calibrated
            .iter()
            .map(|s| CalibratedRow {
                label: s.label.clone(),
                mean: s.mean.clone(),
                low: s.low.clone(),
                high: s.high.clone(),
            })
            .collect();
        result.misclassification = misclassification_tables(calibration);
    }

    result.files = written;
    result
}
