//! Job parameters
//!
//! Every identifier accepted at submission is parsed into one of these types,
//! so an unrecognized job type, algorithm or age group never reaches the Job Store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of computation a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Classification of VA records only
    #[serde(alias = "openva")]
    ClassifyOnly,
    /// Calibration of already-classified records
    #[serde(alias = "vacalibration")]
    CalibrateOnly,
    /// Classification followed by calibration
    #[serde(alias = "pipeline")]
    FullPipeline,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ClassifyOnly => "classify-only",
            JobType::CalibrateOnly => "calibrate-only",
            JobType::FullPipeline => "full-pipeline",
        }
    }

    /// Whether the job runs classifier engines
    pub fn classifies(&self) -> bool {
        matches!(self, JobType::ClassifyOnly | JobType::FullPipeline)
    }

    /// Whether the job runs the calibration stage
    pub fn calibrates(&self) -> bool {
        matches!(self, JobType::CalibrateOnly | JobType::FullPipeline)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classify-only" | "classify_only" | "openva" => Ok(JobType::ClassifyOnly),
            "calibrate-only" | "calibrate_only" | "vacalibration" => Ok(JobType::CalibrateOnly),
            "full-pipeline" | "full_pipeline" | "pipeline" => Ok(JobType::FullPipeline),
            other => Err(format!("Unknown job type: {}", other)),
        }
    }
}

/// Verbal-autopsy classification algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "InterVA")]
    InterVa,
    #[serde(rename = "InSilicoVA")]
    InSilicoVa,
    #[serde(rename = "EAVA")]
    Eava,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::InterVa, Algorithm::InSilicoVa, Algorithm::Eava];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::InterVa => "InterVA",
            Algorithm::InSilicoVa => "InSilicoVA",
            Algorithm::Eava => "EAVA",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("Unknown algorithm: {}", wanted))
    }
}

/// Age group of the deceased; selects the canonical cause set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeGroup {
    Neonate,
    Child,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Neonate => "neonate",
            AgeGroup::Child => "child",
        }
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgeGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neonate" => Ok(AgeGroup::Neonate),
            "child" => Ok(AgeGroup::Child),
            other => Err(format!("Unknown age group: {}", other)),
        }
    }
}

/// Countries with dedicated misclassification priors
pub const KNOWN_COUNTRIES: [&str; 8] = [
    "Bangladesh",
    "Ethiopia",
    "Kenya",
    "Mali",
    "Mozambique",
    "Sierra Leone",
    "South Africa",
    "other",
];

/// Canonical spelling of a known country, if any
pub fn canonical_country(name: &str) -> Option<&'static str> {
    let wanted = name.trim();
    KNOWN_COUNTRIES
        .into_iter()
        .find(|c| c.eq_ignore_ascii_case(wanted))
}

/// How misclassification uncertainty enters calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalibrationVariant {
    /// Misclassification matrices are sampled alongside the cause fractions
    #[serde(alias = "Mmatprior")]
    FullUncertainty,
    /// Misclassification matrices are held at their prior mean
    #[serde(alias = "Mmatfixed")]
    Fixed,
}

impl Default for CalibrationVariant {
    fn default() -> Self {
        CalibrationVariant::FullUncertainty
    }
}

impl FromStr for CalibrationVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full-uncertainty" | "full_uncertainty" | "mmatprior" => {
                Ok(CalibrationVariant::FullUncertainty)
            }
            "fixed" | "mmatfixed" => Ok(CalibrationVariant::Fixed),
            other => Err(format!("Unknown calibration variant: {}", other)),
        }
    }
}

/// MCMC sampling parameters for calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McmcParams {
    /// Total iterations including burn-in (default: 5000)
    #[serde(default = "default_n_mcmc")]
    pub n_mcmc: usize,

    /// Iterations discarded before recording samples (default: 2000)
    #[serde(default = "default_n_burn")]
    pub n_burn: usize,

    /// Keep every n-th post-burn-in sample (default: 1)
    #[serde(default = "default_n_thin")]
    pub n_thin: usize,

    /// Random seed (default: 1)
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_n_mcmc() -> usize {
    5000
}

fn default_n_burn() -> usize {
    2000
}

fn default_n_thin() -> usize {
    1
}

fn default_seed() -> u64 {
    1
}

impl Default for McmcParams {
    fn default() -> Self {
        Self {
            n_mcmc: default_n_mcmc(),
            n_burn: default_n_burn(),
            n_thin: default_n_thin(),
            seed: default_seed(),
        }
    }
}

impl McmcParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.n_thin == 0 {
            return Err("n_thin must be at least 1".to_string());
        }
        if self.n_burn >= self.n_mcmc {
            return Err(format!(
                "n_burn ({}) must be smaller than n_mcmc ({})",
                self.n_burn, self.n_mcmc
            ));
        }
        Ok(())
    }

    /// Number of samples retained after burn-in and thinning
    pub fn retained_samples(&self) -> usize {
        (self.n_mcmc - self.n_burn).div_ceil(self.n_thin)
    }
}

/// Validated parameters stored with every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Algorithms in submission order; the first is the primary
    pub algorithms: Vec<Algorithm>,
    pub age_group: AgeGroup,
    pub country: String,
    pub calibration_variant: CalibrationVariant,
    pub ensemble: bool,
    pub mcmc: McmcParams,
}

impl JobParameters {
    pub fn primary_algorithm(&self) -> Option<Algorithm> {
        self.algorithms.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_accepts_legacy_aliases() {
        assert_eq!("pipeline".parse::<JobType>().unwrap(), JobType::FullPipeline);
        assert_eq!("openva".parse::<JobType>().unwrap(), JobType::ClassifyOnly);
        assert_eq!("vacalibration".parse::<JobType>().unwrap(), JobType::CalibrateOnly);
        assert_eq!("Full-Pipeline".parse::<JobType>().unwrap(), JobType::FullPipeline);
        assert!("batch".parse::<JobType>().is_err());
    }

    #[test]
    fn job_type_serde_uses_kebab_case() {
        let json = serde_json::to_string(&JobType::CalibrateOnly).unwrap();
        assert_eq!(json, "\"calibrate-only\"");
        let parsed: JobType = serde_json::from_str("\"pipeline\"").unwrap();
        assert_eq!(parsed, JobType::FullPipeline);
    }

    #[test]
    fn algorithm_parse_is_case_insensitive() {
        assert_eq!("interva".parse::<Algorithm>().unwrap(), Algorithm::InterVa);
        assert_eq!("InSilicoVA".parse::<Algorithm>().unwrap(), Algorithm::InSilicoVa);
        assert_eq!(" eava ".parse::<Algorithm>().unwrap(), Algorithm::Eava);
        assert!("Tariff".parse::<Algorithm>().is_err());
    }

    #[test]
    fn calibration_variant_aliases() {
        assert_eq!(
            "Mmatprior".parse::<CalibrationVariant>().unwrap(),
            CalibrationVariant::FullUncertainty
        );
        assert_eq!("Mmatfixed".parse::<CalibrationVariant>().unwrap(), CalibrationVariant::Fixed);
    }

    #[test]
    fn country_lookup() {
        assert_eq!(canonical_country("sierra leone"), Some("Sierra Leone"));
        assert_eq!(canonical_country("Atlantis"), None);
    }

    #[test]
    fn mcmc_validation() {
        assert!(McmcParams::default().validate().is_ok());
        let bad = McmcParams { n_burn: 10, n_mcmc: 10, ..McmcParams::default() };
        assert!(bad.validate().is_err());
        let bad = McmcParams { n_thin: 0, ..McmcParams::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn retained_samples_rounds_up() {
        let p = McmcParams { n_mcmc: 100, n_burn: 10, n_thin: 4, seed: 1 };
        // iterations 10, 14, ..., 98 -> 23 samples
        assert_eq!(p.retained_samples(), 23);
    }
}
