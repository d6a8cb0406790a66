//! Common error types for VACAL

use thiserror::Error;

/// Common result type for VACAL operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across VACAL crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when SQLite reported lock contention ("database is locked").
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(err) => err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_not_lock_contention() {
        let err = Error::Internal("database is locked".to_string());
        assert!(!err.is_lock_contention());
    }

    #[test]
    fn display_includes_category() {
        let err = Error::NotFound("job 42".to_string());
        assert_eq!(err.to_string(), "Not found: job 42");
    }
}
