//! Cause taxonomy
//!
//! Classifiers emit fine-grained, algorithm-specific free-text labels. Calibration
//! works on a small canonical (broad) cause set per age group. This module holds
//! both vocabularies, the synonym table for labels the categorizer does not know,
//! and the categorizer itself.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::models::{AgeGroup, CauseAssignment};

/// Canonical neonatal causes, in column order
pub const NEONATE_CAUSES: [&str; 6] = [
    "congenital_malformation",
    "pneumonia",
    "sepsis_meningitis_inf",
    "ipre",
    "other",
    "prematurity",
];

/// Canonical child causes, in column order
pub const CHILD_CAUSES: [&str; 9] = [
    "malaria",
    "pneumonia",
    "diarrhea",
    "severewasting",
    "hiv",
    "injury",
    "other",
    "other_infections",
    "nn_causes",
];

/// Broad category used for labels nothing else claims
pub const OTHER_CAUSE: &str = "other";

pub fn canonical_causes(age_group: AgeGroup) -> &'static [&'static str] {
    match age_group {
        AgeGroup::Neonate => &NEONATE_CAUSES,
        AgeGroup::Child => &CHILD_CAUSES,
    }
}

/// Fine label → broad cause, neonates
const NEONATE_LABELS: &[(&str, &str)] = &[
    ("Congenital malformation", "congenital_malformation"),
    ("Neonatal pneumonia", "pneumonia"),
    ("Neonatal sepsis", "sepsis_meningitis_inf"),
    ("Meningitis and encephalitis", "sepsis_meningitis_inf"),
    ("Birth asphyxia", "ipre"),
    ("Intrapartum related events", "ipre"),
    ("Other and unspecified neonatal CoD", "other"),
    ("Prematurity", "prematurity"),
];

/// Fine label → broad cause, children
const CHILD_LABELS: &[(&str, &str)] = &[
    ("Malaria", "malaria"),
    ("Acute resp infect incl pneumonia", "pneumonia"),
    ("Diarrhoeal diseases", "diarrhea"),
    ("Severe malnutrition", "severewasting"),
    ("HIV/AIDS related death", "hiv"),
    ("Road traffic accident", "injury"),
    ("Accid drowning and submersion", "injury"),
    ("Other and unspecified external CoD", "injury"),
    ("Other and unspecified NCD", "other"),
    ("Congenital malformation", "other"),
    ("Meningitis and encephalitis", "other_infections"),
    ("Measles", "other_infections"),
    ("Pulmonary tuberculosis", "other_infections"),
    ("Sepsis (non-obstetric)", "other_infections"),
    ("Other and unspecified infect dis", "other_infections"),
    ("Prematurity", "nn_causes"),
    ("Birth asphyxia", "nn_causes"),
    ("Neonatal sepsis", "nn_causes"),
    ("Neonatal pneumonia", "nn_causes"),
];

fn vocabulary(age_group: AgeGroup) -> &'static [(&'static str, &'static str)] {
    match age_group {
        AgeGroup::Neonate => NEONATE_LABELS,
        AgeGroup::Child => CHILD_LABELS,
    }
}

/// Labels classifiers emit that the categorizer does not recognize, with the
/// recognized label each one stands for.
const NEONATE_SYNONYMS: &[(&str, &str)] = &[
    ("Undetermined", "Other and unspecified neonatal CoD"),
    ("Sepsis", "Neonatal sepsis"),
    ("Pneumonia", "Neonatal pneumonia"),
    ("Acute resp infect incl pneumonia", "Neonatal pneumonia"),
    ("Preterm", "Prematurity"),
    ("Injury", "Other and unspecified neonatal CoD"),
];

const CHILD_SYNONYMS: &[(&str, &str)] = &[
    ("Undetermined", "Other and unspecified NCD"),
    ("Diarrhea/Dysentery", "Diarrhoeal diseases"),
    ("Sepsis", "Sepsis (non-obstetric)"),
    ("Pneumonia", "Acute resp infect incl pneumonia"),
    ("Malnutrition", "Severe malnutrition"),
    ("HIV", "HIV/AIDS related death"),
    ("Injury", "Other and unspecified external CoD"),
];

fn synonyms(age_group: AgeGroup) -> &'static [(&'static str, &'static str)] {
    match age_group {
        AgeGroup::Neonate => NEONATE_SYNONYMS,
        AgeGroup::Child => CHILD_SYNONYMS,
    }
}

/// Whether the categorizer recognizes `label` for this age group
pub fn is_recognized(age_group: AgeGroup, label: &str) -> bool {
    vocabulary(age_group).iter().any(|(l, _)| *l == label)
}

/// Recognized label standing for an unrecognized synonym (case-insensitive)
pub fn synonym_for(age_group: AgeGroup, label: &str) -> Option<&'static str> {
    let wanted = label.trim();
    synonyms(age_group)
        .iter()
        .find(|(s, _)| s.eq_ignore_ascii_case(wanted))
        .map(|(_, target)| *target)
}

/// A recognized label that maps to `cause`, used for sentinel rows
pub fn representative_label(age_group: AgeGroup, cause: &str) -> Option<&'static str> {
    vocabulary(age_group)
        .iter()
        .find(|(_, broad)| *broad == cause)
        .map(|(label, _)| *label)
}

/// Recognized label for the catch-all category
pub fn fallback_label(age_group: AgeGroup) -> &'static str {
    match age_group {
        AgeGroup::Neonate => "Other and unspecified neonatal CoD",
        AgeGroup::Child => "Other and unspecified NCD",
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CategorizeError {
    #[error("Unrecognized cause label '{label}' for record '{id}'")]
    UnrecognizedLabel { id: String, label: String },

    #[error("Category '{0}' has no records")]
    MissingCategory(String),
}

/// One-hot output of a categorizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorizedTable {
    pub ids: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<u8>>,
}

/// Maps fine labels to broad causes, one indicator row per record.
///
/// Implementations may be as strict as they like about their input; callers
/// that need full coverage go through the Cause Normalizer.
pub trait CauseCategorizer: Send + Sync {
    fn categorize(
        &self,
        age_group: AgeGroup,
        assignments: &[CauseAssignment],
    ) -> Result<CategorizedTable, CategorizeError>;
}

/// Table-driven categorizer over the built-in vocabulary.
///
/// Fails on any label outside the vocabulary and on any canonical category
/// that no record maps to. Only observed categories become columns, sorted
/// by name.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadCauseMap;

impl CauseCategorizer for BroadCauseMap {
    fn categorize(
        &self,
        age_group: AgeGroup,
        assignments: &[CauseAssignment],
    ) -> Result<CategorizedTable, CategorizeError> {
        let lookup: BTreeMap<&str, &str> = vocabulary(age_group).iter().copied().collect();

        let mut broad = Vec::with_capacity(assignments.len());
        for a in assignments {
            let cause = lookup.get(a.cause.as_str()).ok_or_else(|| CategorizeError::UnrecognizedLabel {
                id: a.id.clone(),
                label: a.cause.clone(),
            })?;
            broad.push(*cause);
        }

        let observed: BTreeSet<&str> = broad.iter().copied().collect();
        if let Some(missing) = canonical_causes(age_group).iter().find(|c| !observed.contains(*c)) {
            return Err(CategorizeError::MissingCategory(missing.to_string()));
        }

        let columns: Vec<String> = observed.iter().map(|c| c.to_string()).collect();
        let rows = broad
            .iter()
            .map(|cause| columns.iter().map(|c| u8::from(c == cause)).collect())
            .collect();

        Ok(CategorizedTable {
            ids: assignments.iter().map(|a| a.id.clone()).collect(),
            columns,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_canonical_cause_has_a_representative() {
        for age in [AgeGroup::Neonate, AgeGroup::Child] {
            for cause in canonical_causes(age) {
                let label = representative_label(age, cause)
                    .unwrap_or_else(|| panic!("no label for {} / {}", age, cause));
                assert!(is_recognized(age, label));
            }
            assert!(is_recognized(age, fallback_label(age)));
        }
    }

    #[test]
    fn synonyms_point_at_recognized_labels() {
        for age in [AgeGroup::Neonate, AgeGroup::Child] {
            for (synonym, target) in synonyms(age) {
                assert!(is_recognized(age, target), "{} -> {}", synonym, target);
            }
        }
        assert_eq!(synonym_for(AgeGroup::Child, "undetermined"), Some("Other and unspecified NCD"));
        assert_eq!(synonym_for(AgeGroup::Child, "Malaria"), None);
    }

    #[test]
    fn broad_map_rejects_unknown_label() {
        let input = vec![CauseAssignment::new("1", "Dragon bite")];
        let err = BroadCauseMap.categorize(AgeGroup::Neonate, &input).unwrap_err();
        assert!(matches!(err, CategorizeError::UnrecognizedLabel { .. }));
    }

    #[test]
    fn broad_map_rejects_partial_coverage() {
        let input = vec![
            CauseAssignment::new("1", "Prematurity"),
            CauseAssignment::new("2", "Birth asphyxia"),
        ];
        let err = BroadCauseMap.categorize(AgeGroup::Neonate, &input).unwrap_err();
        assert_eq!(err, CategorizeError::MissingCategory("congenital_malformation".to_string()));
    }

    #[test]
    fn broad_map_one_hot_over_full_coverage() {
        let input: Vec<CauseAssignment> = NEONATE_CAUSES
            .iter()
            .enumerate()
            .map(|(i, c)| CauseAssignment::new(i.to_string(), representative_label(AgeGroup::Neonate, c).unwrap()))
            .collect();
        let table = BroadCauseMap.categorize(AgeGroup::Neonate, &input).unwrap();

        assert_eq!(table.columns.len(), 6);
        assert_eq!(table.rows.len(), 6);
        for row in &table.rows {
            assert_eq!(row.iter().map(|&v| v as u32).sum::<u32>(), 1);
        }
        // sorted by name, not canonical order
        assert_eq!(table.columns[0], "congenital_malformation");
        assert_eq!(table.columns[1], "ipre");
    }
}
