//! Job results, log entries and registered output files

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Algorithm, AgeGroup, CalibrationVariant, JobParameters, JobType};

/// One line of a job's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogEntry {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Artifact written by the Result Materializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    /// Location on disk
    pub location: String,
    pub size_bytes: u64,
}

/// Non-primary algorithm dropped after a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedAlgorithm {
    pub algorithm: Algorithm,
    pub reason: String,
}

/// Per-algorithm classification summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub algorithm: Algorithm,
    pub records: usize,
    /// Uncalibrated fraction per free-text cause label
    pub csmf: BTreeMap<String, f64>,
}

/// Labeled fraction vector over the canonical causes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsmfRow {
    pub label: String,
    pub values: Vec<f64>,
}

/// Posterior summary per canonical cause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedRow {
    pub label: String,
    pub mean: Vec<f64>,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

/// Flat true-cause × predicted-cause table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisclassificationTable {
    /// Artifact-style name, qualified by algorithm when several are present
    pub name: String,
    pub algorithm: String,
    /// Header: `true_cause` followed by the predicted causes
    pub header: Vec<String>,
    pub rows: Vec<MisclassificationRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisclassificationRow {
    pub true_cause: String,
    pub values: Vec<f64>,
}

/// Structured payload attached to a Completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_type: JobType,
    /// Algorithms that produced output
    pub algorithms: Vec<Algorithm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_algorithms: Vec<DroppedAlgorithm>,
    pub age_group: AgeGroup,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_variant: Option<CalibrationVariant>,
    /// Whether an ensemble row was produced
    pub ensemble: bool,
    /// Canonical cause columns of the calibration tables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classification: Vec<ClassificationSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uncalibrated_csmf: Vec<CsmfRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calibrated_csmf: Vec<CalibratedRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub misclassification: Vec<MisclassificationTable>,
    #[serde(default)]
    pub files: Vec<OutputFile>,
}

impl JobResult {
    /// Result with identity fields filled and no tables
    pub fn empty(job_type: JobType, params: &JobParameters) -> Self {
        Self {
            job_type,
            algorithms: Vec::new(),
            dropped_algorithms: Vec::new(),
            age_group: params.age_group,
            country: params.country.clone(),
            calibration_variant: job_type.calibrates().then_some(params.calibration_variant),
            ensemble: false,
            causes: Vec::new(),
            classification: Vec::new(),
            uncalibrated_csmf: Vec::new(),
            calibrated_csmf: Vec::new(),
            misclassification: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn calibrated_row(&self, label: &str) -> Option<&CalibratedRow> {
        self.calibrated_csmf.iter().find(|r| r.label == label)
    }
}
