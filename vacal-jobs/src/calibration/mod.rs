//! Calibration Stage
//!
//! A [`CalibrationEngine`] returns raw arrays whose rank depends on the mode:
//!
//! | mode                | uncalibrated / mean / low / high | misclassification |
//! |---------------------|----------------------------------|-------------------|
//! | single algorithm    | `[C]`                            | `[C, C]`          |
//! | ensemble of N       | `[N + 1, C]`                     | `[N, C, C]`       |
//!
//! [`CalibrationStage`] turns either shape into labeled rows
//! ([`CalibrationOutput`]), so nothing downstream looks at array rank.

pub mod gibbs;
pub mod priors;

use ndarray::{ArrayD, Axis};
use thiserror::Error;

use crate::models::{AgeGroup, Algorithm, CalibrationVariant, McmcParams};
use crate::services::normalizer::CategoryMatrix;

pub use gibbs::GibbsEngine;
pub use priors::{JsonPriors, ParametricPriors, PriorProvider};

/// Row label of the combined estimate
pub const ENSEMBLE_LABEL: &str = "ensemble";

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration engine unavailable: {0}")]
    Unavailable(String),

    #[error("Calibration failed: {0}")]
    Failed(String),

    #[error("Unexpected calibration shape: {0}")]
    Shape(String),

    #[error("Ensemble calibration needs at least 2 algorithms, got {0}")]
    EnsembleTooSmall(usize),

    #[error("Nothing to calibrate")]
    NoInput,
}

/// One engine call
pub struct CalibrationRequest<'a> {
    /// Algorithms with their category matrices, in order
    pub inputs: Vec<(Algorithm, &'a CategoryMatrix)>,
    pub age_group: AgeGroup,
    pub country: String,
    pub variant: CalibrationVariant,
    pub mcmc: McmcParams,
    pub ensemble: bool,
}

impl CalibrationRequest<'_> {
    pub fn causes(&self) -> Vec<String> {
        self.inputs
            .first()
            .map(|(_, m)| m.causes.clone())
            .unwrap_or_default()
    }
}

/// Engine output before rank normalization
#[derive(Debug, Clone)]
pub struct RawCalibration {
    pub uncalibrated: ArrayD<f64>,
    pub mean: ArrayD<f64>,
    pub low: ArrayD<f64>,
    pub high: ArrayD<f64>,
    pub misclassification: ArrayD<f64>,
}

pub trait CalibrationEngine: Send + Sync {
    fn calibrate(&self, request: &CalibrationRequest<'_>) -> Result<RawCalibration, CalibrationError>;
}

/// Posterior summary of one labeled row
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSummary {
    pub label: String,
    pub mean: Vec<f64>,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

/// Rank-free calibration result
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationOutput {
    pub causes: Vec<String>,
    /// Row label → uncalibrated fractions
    pub uncalibrated: Vec<(String, Vec<f64>)>,
    pub calibrated: Vec<LabeledSummary>,
    /// Algorithm → `[true][predicted]` matrix
    pub misclassification: Vec<(Algorithm, Vec<Vec<f64>>)>,
    /// Whether a combined ensemble row is present
    pub ensemble: bool,
}

impl CalibrationOutput {
    fn extend(&mut self, other: CalibrationOutput) {
        if self.causes.is_empty() {
            self.causes = other.causes;
        }
        self.uncalibrated.extend(other.uncalibrated);
        self.calibrated.extend(other.calibrated);
        self.misclassification.extend(other.misclassification);
        self.ensemble |= other.ensemble;
    }
}

pub struct CalibrationStage<'a> {
    engine: &'a dyn CalibrationEngine,
}

impl<'a> CalibrationStage<'a> {
    pub fn new(engine: &'a dyn CalibrationEngine) -> Self {
        Self { engine }
    }

    /// Calibrate every input.
    ///
    /// Ensemble requests go to the engine as one call and need at least two
    /// algorithms. Otherwise each algorithm is calibrated on its own, with the
    /// seed offset by its position.
    pub fn run(&self, request: &CalibrationRequest<'_>) -> Result<CalibrationOutput, CalibrationError> {
        if request.inputs.is_empty() {
            return Err(CalibrationError::NoInput);
        }
        let causes = request.causes();
        if request.inputs.iter().any(|(_, m)| m.causes != causes) {
            return Err(CalibrationError::Shape("inputs disagree on cause columns".to_string()));
        }

        if request.ensemble {
            if request.inputs.len() < 2 {
                return Err(CalibrationError::EnsembleTooSmall(request.inputs.len()));
            }
            let raw = self.engine.calibrate(request)?;
            let labels: Vec<String> = request
                .inputs
                .iter()
                .map(|(a, _)| a.to_string())
                .chain(std::iter::once(ENSEMBLE_LABEL.to_string()))
                .collect();
            let algorithms: Vec<Algorithm> = request.inputs.iter().map(|(a, _)| *a).collect();
            let mut out = normalize(raw, &causes, &labels, &algorithms)?;
            out.ensemble = true;
            return Ok(out);
        }

        let mut out = CalibrationOutput::default();
        for (i, (algorithm, matrix)) in request.inputs.iter().enumerate() {
            let single = CalibrationRequest {
                inputs: vec![(*algorithm, *matrix)],
                age_group: request.age_group,
                country: request.country.clone(),
                variant: request.variant,
                mcmc: McmcParams {
                    seed: request.mcmc.seed.wrapping_add(i as u64),
                    ..request.mcmc
                },
                ensemble: false,
            };
            let raw = self.engine.calibrate(&single)?;
            out.extend(normalize(raw, &causes, &[algorithm.to_string()], &[*algorithm])?);
        }
        Ok(out)
    }
}

/// Split an array into `rows` vectors of length `width`; rank 1 counts as one row
fn labeled_rows(name: &str, array: &ArrayD<f64>, rows: usize, width: usize) -> Result<Vec<Vec<f64>>, CalibrationError> {
    let shape = array.shape().to_vec();
    let out: Vec<Vec<f64>> = match array.ndim() {
        1 => vec![array.iter().copied().collect()],
        2 => array
            .axis_iter(Axis(0))
            .map(|r| r.iter().copied().collect())
            .collect(),
        _ => return Err(CalibrationError::Shape(format!("{} has shape {:?}", name, shape))),
    };
    if out.len() != rows || out.iter().any(|r| r.len() != width) {
        return Err(CalibrationError::Shape(format!(
            "{} has shape {:?}, expected {} rows of {}",
            name, shape, rows, width
        )));
    }
    Ok(out)
}

/// Split a misclassification array into `count` square matrices; rank 2 counts as one
fn labeled_matrices(array: &ArrayD<f64>, count: usize, width: usize) -> Result<Vec<Vec<Vec<f64>>>, CalibrationError> {
    let shape = array.shape().to_vec();
    let to_matrix = |m: ndarray::ArrayViewD<'_, f64>| -> Vec<Vec<f64>> {
        m.axis_iter(Axis(0))
            .map(|r| r.iter().copied().collect())
            .collect()
    };
    let out: Vec<Vec<Vec<f64>>> = match array.ndim() {
        2 => vec![to_matrix(array.view())],
        3 => array.axis_iter(Axis(0)).map(to_matrix).collect(),
        _ => return Err(CalibrationError::Shape(format!("misclassification has shape {:?}", shape))),
    };
    let square = |m: &Vec<Vec<f64>>| m.len() == width && m.iter().all(|r| r.len() == width);
    if out.len() != count || !out.iter().all(square) {
        return Err(CalibrationError::Shape(format!(
            "misclassification has shape {:?}, expected {} of {}x{}",
            shape, count, width, width
        )));
    }
    if out.iter().flatten().flatten().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(CalibrationError::Shape("misclassification has negative entries".to_string()));
    }
    Ok(out)
}

fn normalize(
    raw: RawCalibration,
    causes: &[String],
    labels: &[String],
    algorithms: &[Algorithm],
) -> Result<CalibrationOutput, CalibrationError> {
    let c = causes.len();
    let n = labels.len();

    let uncalibrated = labeled_rows("uncalibrated", &raw.uncalibrated, n, c)?;
    let mean = labeled_rows("mean", &raw.mean, n, c)?;
    let low = labeled_rows("low", &raw.low, n, c)?;
    let high = labeled_rows("high", &raw.high, n, c)?;
    let matrices = labeled_matrices(&raw.misclassification, algorithms.len(), c)?;

    let calibrated = labels
        .iter()
        .zip(mean.into_iter().zip(low).zip(high))
        .map(|(label, ((mean, low), high))| {
            let (low, high) = ordered_bounds(&mean, low, high);
            LabeledSummary {
                label: label.clone(),
                mean,
                low,
                high,
            }
        })
        .collect();

    Ok(CalibrationOutput {
        causes: causes.to_vec(),
        uncalibrated: labels.iter().cloned().zip(uncalibrated).collect(),
        calibrated,
        misclassification: algorithms.iter().copied().zip(matrices).collect(),
        ensemble: false,
    })
}

/// Clamp bounds into [0, 1] around the mean
fn ordered_bounds(mean: &[f64], low: Vec<f64>, high: Vec<f64>) -> (Vec<f64>, Vec<f64>) {
    let low = low
        .into_iter()
        .zip(mean)
        .map(|(l, m)| l.min(*m).clamp(0.0, 1.0))
        .collect();
    let high = high
        .into_iter()
        .zip(mean)
        .map(|(h, m)| h.max(*m).clamp(0.0, 1.0))
        .collect();
    (low, high)
}
