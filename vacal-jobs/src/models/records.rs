//! Tabular input records

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Name of the record identifier column
pub const ID_COLUMN: &str = "ID";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Missing required column '{0}'")]
    MissingColumn(String),

    #[error("Row {row} has {found} values, expected {expected}")]
    RaggedRow { row: usize, found: usize, expected: usize },

    #[error("Duplicate record id '{0}'")]
    DuplicateId(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Rectangular table of string cells with named columns
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    /// Parse CSV text with a header row
    pub fn from_csv(text: &str) -> Result<Self, RecordError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let columns = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Ok(Self { columns, rows })
    }

    /// Write the table as CSV
    pub fn write_csv(&self, path: &Path) -> Result<(), RecordError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Case-insensitive column lookup
    pub fn column_index_ignore_case(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Check shape, presence of the ID column and id uniqueness
    pub fn validate(&self) -> Result<(), RecordError> {
        let id_col = self
            .column_index(ID_COLUMN)
            .ok_or_else(|| RecordError::MissingColumn(ID_COLUMN.to_string()))?;

        let mut seen = HashSet::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(RecordError::RaggedRow {
                    row: i,
                    found: row.len(),
                    expected: self.columns.len(),
                });
            }
            if !seen.insert(row[id_col].as_str()) {
                return Err(RecordError::DuplicateId(row[id_col].clone()));
            }
        }
        Ok(())
    }

    /// Record ids in row order
    pub fn ids(&self) -> Result<Vec<String>, RecordError> {
        self.column_values(ID_COLUMN)
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<String>, RecordError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| RecordError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|r| r.get(idx).cloned().unwrap_or_default()).collect())
    }

    /// Copy of the table with `(column, default)` appended for every missing column.
    ///
    /// Returns the new table and the names of the injected columns.
    pub fn with_defaults(&self, required: &[(String, String)]) -> (RecordTable, Vec<String>) {
        let mut table = self.clone();
        let mut injected = Vec::new();
        for (column, default) in required {
            if table.column_index(column).is_some() {
                continue;
            }
            table.columns.push(column.clone());
            for row in &mut table.rows {
                row.push(default.clone());
            }
            injected.push(column.clone());
        }
        (table, injected)
    }
}

/// One record's cause label as produced by a classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseAssignment {
    pub id: String,
    pub cause: String,
}

impl CauseAssignment {
    pub fn new(id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cause: cause.into(),
        }
    }
}
