//! Misclassification priors
//!
//! A prior is a row-stochastic `[true cause × predicted cause]` matrix per
//! algorithm, age group and country. The built-in parametric priors use an
//! algorithm-specific sensitivity on the diagonal and spread the remainder
//! uniformly. A JSON priors file can override them:
//!
//! ```json
//! { "InterVA": { "neonate": { "Mozambique": [[...], ...], "other": [[...], ...] } } }
//! ```
//!
//! Lookups in the file fall back from the requested country to `other`, then to
//! the parametric priors. Strict priors stop before the last step and report the
//! engine as unavailable.

use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;
use vacal_common::{Error, Result};

use super::CalibrationError;
use crate::models::{AgeGroup, Algorithm};
use crate::services::demo_data::stable_unit;

pub trait PriorProvider: Send + Sync {
    fn misclassification_prior(
        &self,
        algorithm: Algorithm,
        age_group: AgeGroup,
        country: &str,
        causes: &[String],
    ) -> std::result::Result<Array2<f64>, CalibrationError>;
}

/// Diagonal-dominant priors derived from algorithm and country
#[derive(Debug, Default, Clone, Copy)]
pub struct ParametricPriors;

impl ParametricPriors {
    fn sensitivity(algorithm: Algorithm, country: &str) -> f64 {
        let base = match algorithm {
            Algorithm::InterVa => 0.55,
            Algorithm::InSilicoVa => 0.6,
            Algorithm::Eava => 0.65,
        };
        // +/- 0.05 per country
        base + (stable_unit(&["sensitivity", algorithm.as_str(), country]) - 0.5) * 0.1
    }
}

impl PriorProvider for ParametricPriors {
    fn misclassification_prior(
        &self,
        algorithm: Algorithm,
        _age_group: AgeGroup,
        country: &str,
        causes: &[String],
    ) -> std::result::Result<Array2<f64>, CalibrationError> {
        let c = causes.len();
        if c < 2 {
            return Err(CalibrationError::Shape(format!("{} causes, need at least 2", c)));
        }
        let s = Self::sensitivity(algorithm, country);
        let off = (1.0 - s) / (c - 1) as f64;
        Ok(Array2::from_shape_fn((c, c), |(i, j)| if i == j { s } else { off }))
    }
}

type PriorTable = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<Vec<f64>>>>>;

/// Priors read from a JSON file, parametric where the file has no entry
#[derive(Debug, Clone)]
pub struct JsonPriors {
    table: PriorTable,
    strict: bool,
}

impl JsonPriors {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| Error::Config(format!("Invalid priors file {}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            table: serde_json::from_str(text)?,
            strict: false,
        })
    }

    /// Refuse combinations the file does not cover
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn lookup(&self, algorithm: Algorithm, age_group: AgeGroup, country: &str) -> Option<&Vec<Vec<f64>>> {
        let by_country = self.table.get(algorithm.as_str())?.get(age_group.as_str())?;
        by_country.get(country).or_else(|| by_country.get("other"))
    }
}

impl PriorProvider for JsonPriors {
    fn misclassification_prior(
        &self,
        algorithm: Algorithm,
        age_group: AgeGroup,
        country: &str,
        causes: &[String],
    ) -> std::result::Result<Array2<f64>, CalibrationError> {
        let Some(rows) = self.lookup(algorithm, age_group, country) else {
            if self.strict {
                return Err(CalibrationError::Unavailable(format!(
                    "no misclassification prior for {}/{}/{}",
                    algorithm, age_group, country
                )));
            }
            return ParametricPriors.misclassification_prior(algorithm, age_group, country, causes);
        };

        let c = causes.len();
        if rows.len() != c || rows.iter().any(|r| r.len() != c) {
            return Err(CalibrationError::Shape(format!(
                "prior for {}/{}/{} is not {}x{}",
                algorithm, age_group, country, c, c
            )));
        }

        let mut prior = Array2::zeros((c, c));
        for (i, row) in rows.iter().enumerate() {
            if row.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(CalibrationError::Shape(format!("prior row {} has a negative entry", i)));
            }
            let total: f64 = row.iter().sum();
            if total <= 0.0 {
                return Err(CalibrationError::Shape(format!("prior row {} sums to zero", i)));
            }
            for (j, v) in row.iter().enumerate() {
                prior[[i, j]] = v / total;
            }
        }
        Ok(prior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn causes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    #[test]
    fn parametric_rows_are_stochastic() {
        let p = ParametricPriors
            .misclassification_prior(Algorithm::Eava, AgeGroup::Child, "Kenya", &causes(9))
            .unwrap();
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        assert!(p[[0, 0]] > p[[0, 1]]);
    }

    #[test]
    fn json_priors_fall_back_to_other_then_parametric() {
        let json = r#"{"InterVA": {"neonate": {"other": [[2, 2], [0, 1]]}}}"#;
        let priors = JsonPriors::from_json(json).unwrap();

        let p = priors
            .misclassification_prior(Algorithm::InterVa, AgeGroup::Neonate, "Mali", &causes(2))
            .unwrap();
        assert_eq!(p[[0, 0]], 0.5);
        assert_eq!(p[[1, 1]], 1.0);

        let q = priors
            .misclassification_prior(Algorithm::Eava, AgeGroup::Neonate, "Mali", &causes(2))
            .unwrap();
        assert_eq!(
            q,
            ParametricPriors
                .misclassification_prior(Algorithm::Eava, AgeGroup::Neonate, "Mali", &causes(2))
                .unwrap()
        );
    }

    #[test]
    fn json_priors_reject_wrong_shape() {
        let json = r#"{"InterVA": {"child": {"Kenya": [[1, 0], [0, 1]]}}}"#;
        let priors = JsonPriors::from_json(json).unwrap();
        let err = priors
            .misclassification_prior(Algorithm::InterVa, AgeGroup::Child, "Kenya", &causes(9))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Shape(_)));
    }

    #[test]
    fn strict_priors_report_missing_entry_as_unavailable() {
        let json = r#"{"InterVA": {"neonate": {"other": [[1, 0], [0, 1]]}}}"#;
        let priors = JsonPriors::from_json(json).unwrap().strict(true);

        assert!(priors
            .misclassification_prior(Algorithm::InterVa, AgeGroup::Neonate, "Mali", &causes(2))
            .is_ok());
        let err = priors
            .misclassification_prior(Algorithm::Eava, AgeGroup::Neonate, "Mali", &causes(2))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Unavailable(ref m) if m.contains("EAVA")));
    }
}
