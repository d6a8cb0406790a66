//! # VACAL Common Library
//!
//! Shared code for the verbal-autopsy calibration services including:
//! - Common error type
//! - Configuration loading and data folder resolution
//! - SQLite pool initialization
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
