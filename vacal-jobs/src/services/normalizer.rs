//! Cause Normalizer
//!
//! Turns free-text cause labels into a [`CategoryMatrix`] over the full
//! canonical cause set of an age group.
//!
//! The categorizer only knows a fixed vocabulary and refuses inputs that leave
//! any canonical category empty. The normalizer therefore:
//! 1. rewrites known synonyms to recognized labels
//! 2. maps any remaining unrecognized label to the catch-all category (with a warning)
//! 3. pads the input with one sentinel record per canonical category
//! 4. categorizes the padded set
//! 5. drops the sentinel rows by id
//! 6. reorders columns into canonical order, adding any the categorizer omitted

use std::collections::HashSet;
use thiserror::Error;

use crate::causes::{
    canonical_causes, fallback_label, is_recognized, representative_label, synonym_for,
    CategorizeError, CauseCategorizer,
};
use crate::models::{AgeGroup, CauseAssignment};
use crate::services::log_stream::Diagnostics;

/// Prefix of sentinel record ids
pub const SENTINEL_PREFIX: &str = "__pad__";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Categorization failed: {0}")]
    Categorize(#[from] CategorizeError),

    #[error("No recognized label for category '{0}'")]
    NoRepresentative(String),

    #[error("Categorizer returned {found} rows for {expected} records")]
    RowCount { found: usize, expected: usize },

    #[error("Categorizer returned unknown category '{0}'")]
    UnknownCategory(String),

    #[error("Categorizer row for record '{id}' is not one-hot (sum {sum})")]
    InvalidRow { id: String, sum: u32 },
}

/// One-hot record × canonical-cause matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMatrix {
    pub age_group: AgeGroup,
    /// Canonical causes, in column order
    pub causes: Vec<String>,
    pub ids: Vec<String>,
    pub rows: Vec<Vec<u8>>,
}

impl CategoryMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Records per cause
    pub fn column_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.causes.len()];
        for row in &self.rows {
            for (k, &v) in row.iter().enumerate() {
                counts[k] += v as usize;
            }
        }
        counts
    }

    /// Fraction of records per cause (all zero for an empty matrix)
    pub fn column_means(&self) -> Vec<f64> {
        let n = self.rows.len();
        self.column_counts()
            .into_iter()
            .map(|c| if n == 0 { 0.0 } else { c as f64 / n as f64 })
            .collect()
    }
}

/// Normalizer bound to one categorizer
pub struct CauseNormalizer<'a> {
    categorizer: &'a dyn CauseCategorizer,
}

impl<'a> CauseNormalizer<'a> {
    pub fn new(categorizer: &'a dyn CauseCategorizer) -> Self {
        Self { categorizer }
    }

    pub fn normalize(
        &self,
        age_group: AgeGroup,
        assignments: &[CauseAssignment],
        diagnostics: &Diagnostics,
    ) -> Result<CategoryMatrix, NormalizeError> {
        let canonical = canonical_causes(age_group);

        let mut padded: Vec<CauseAssignment> = assignments
            .iter()
            .map(|a| CauseAssignment::new(a.id.as_str(), recognized_label(age_group, &a.cause, diagnostics)))
            .collect();

        let real_ids: HashSet<&str> = assignments.iter().map(|a| a.id.as_str()).collect();
        let sentinels = sentinel_ids(canonical, &real_ids);
        for (cause, id) in canonical.iter().zip(&sentinels) {
            let label = representative_label(age_group, cause)
                .ok_or_else(|| NormalizeError::NoRepresentative(cause.to_string()))?;
            padded.push(CauseAssignment::new(id.as_str(), label));
        }

        let table = self.categorizer.categorize(age_group, &padded)?;
        if table.rows.len() != padded.len() || table.ids.len() != padded.len() {
            return Err(NormalizeError::RowCount {
                found: table.rows.len(),
                expected: padded.len(),
            });
        }

        // Canonical column k comes from categorizer column source[k], if present
        let mut source = vec![None; canonical.len()];
        for (j, column) in table.columns.iter().enumerate() {
            let k = canonical
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| NormalizeError::UnknownCategory(column.clone()))?;
            source[k] = Some(j);
        }

        let sentinel_set: HashSet<&str> = sentinels.iter().map(String::as_str).collect();
        let mut ids = Vec::with_capacity(assignments.len());
        let mut rows = Vec::with_capacity(assignments.len());
        for (id, row) in table.ids.iter().zip(&table.rows) {
            if sentinel_set.contains(id.as_str()) {
                continue;
            }
            let sum: u32 = row.iter().map(|&v| v as u32).sum();
            if row.len() != table.columns.len() || sum != 1 || row.iter().any(|&v| v > 1) {
                return Err(NormalizeError::InvalidRow { id: id.clone(), sum });
            }
            ids.push(id.clone());
            rows.push(
                source
                    .iter()
                    .map(|j| j.and_then(|j| row.get(j).copied()).unwrap_or(0))
                    .collect(),
            );
        }

        if rows.len() != assignments.len() {
            return Err(NormalizeError::RowCount {
                found: rows.len(),
                expected: assignments.len(),
            });
        }

        Ok(CategoryMatrix {
            age_group,
            causes: canonical.iter().map(|c| c.to_string()).collect(),
            ids,
            rows,
        })
    }
}

/// Label the categorizer recognizes for `label`
fn recognized_label(age_group: AgeGroup, label: &str, diagnostics: &Diagnostics) -> String {
    let trimmed = label.trim();
    if is_recognized(age_group, trimmed) {
        return trimmed.to_string();
    }
    if let Some(synonym) = synonym_for(age_group, trimmed) {
        return synonym.to_string();
    }
    diagnostics.warn(format!(
        "Unrecognized cause label '{}' counted as '{}'",
        trimmed,
        fallback_label(age_group)
    ));
    fallback_label(age_group).to_string()
}

/// One sentinel id per canonical cause, none equal to a real id
fn sentinel_ids(canonical: &[&str], real_ids: &HashSet<&str>) -> Vec<String> {
    let mut prefix = SENTINEL_PREFIX.to_string();
    loop {
        let ids: Vec<String> = canonical.iter().map(|c| format!("{}{}", prefix, c)).collect();
        if ids.iter().all(|id| !real_ids.contains(id.as_str())) {
            return ids;
        }
        prefix.push('_');
    }
}
