//! Built-in sample dataset
//!
//! Jobs submitted without input run on a deterministic synthetic dataset: one
//! `ID` column plus a `s_<cause>` symptom indicator (`y`/`n`) per canonical cause
//! of the age group. The generated table is stored with the job, so reruns see
//! the same records.

use sha2::{Digest, Sha256};

use crate::causes::canonical_causes;
use crate::engines::demo::DemoEngine;
use crate::engines::EngineError;
use crate::models::{AgeGroup, Algorithm, RecordTable, ID_COLUMN};

/// Records in the sample dataset
pub const DEMO_RECORDS: usize = 200;

/// Prefix of symptom indicator columns
pub const SYMPTOM_PREFIX: &str = "s_";

/// Stable 64-bit hash of `parts`
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Deterministic fraction in [0, 1) derived from `parts`
pub fn stable_unit(parts: &[&str]) -> f64 {
    (stable_hash(parts) >> 11) as f64 / (1u64 << 53) as f64
}

/// Sample dataset for `age_group`
pub fn demo_records(age_group: AgeGroup) -> RecordTable {
    let causes = canonical_causes(age_group);

    let mut columns = vec![ID_COLUMN.to_string()];
    columns.extend(causes.iter().map(|c| format!("{}{}", SYMPTOM_PREFIX, c)));

    // Skewed toward the first causes so the fractions are not uniform
    let weights: Vec<usize> = (0..causes.len()).map(|i| causes.len() + 2 - i).collect();
    let total: usize = weights.iter().sum();

    let rows = (0..DEMO_RECORDS)
        .map(|i| {
            let id = format!("d{:04}", i + 1);
            let mut pick = (stable_hash(&["demo", age_group.as_str(), &id]) % total as u64) as usize;
            let mut true_cause = 0;
            for (k, w) in weights.iter().enumerate() {
                if pick < *w {
                    true_cause = k;
                    break;
                }
                pick -= w;
            }
            let noise = (stable_hash(&["noise", age_group.as_str(), &id]) % (2 * causes.len() as u64)) as usize;

            let mut row = vec![id];
            row.extend((0..causes.len()).map(|k| {
                if k == true_cause || k == noise {
                    "y".to_string()
                } else {
                    "n".to_string()
                }
            }));
            row
        })
        .collect();

    RecordTable::new(columns, rows)
}

/// Sample input for calibrate-only jobs: `ID` plus one cause column per algorithm,
/// labeled by the built-in classifier
pub fn demo_cause_table(age_group: AgeGroup, algorithms: &[Algorithm]) -> Result<RecordTable, EngineError> {
    let records = demo_records(age_group);
    let mut columns = vec![ID_COLUMN.to_string()];
    let mut rows: Vec<Vec<String>> = records.rows.iter().map(|r| vec![r[0].clone()]).collect();

    for &algorithm in algorithms {
        let assignments = DemoEngine::new(algorithm).assign(age_group, &records)?;
        columns.push(algorithm.as_str().to_string());
        for (row, assignment) in rows.iter_mut().zip(assignments) {
            row.push(assignment.cause);
        }
    }
    Ok(RecordTable::new(columns, rows))
}
