//! Classifier engine adapters
//!
//! Each algorithm is reached through a [`ClassifierEngine`]: records in, one
//! free-text cause label per record out. Engines declare the columns they need
//! (the orchestrator injects defaults for missing ones) and whether they need
//! their input bound to a job-unique file for the duration of the call.

pub mod command;
pub mod demo;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use vacal_common::config::EngineCommandConfig;
use vacal_common::{Error, Result};

use crate::models::{AgeGroup, Algorithm, CauseAssignment, RecordTable};
use crate::services::log_stream::{Diagnostics, OutputBuffer};

pub use command::CommandEngine;
pub use demo::DemoEngine;

/// Adapter failure
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine or a dependency it needs is not usable on this host
    #[error("{engine} is unavailable: {reason}")]
    Unavailable { engine: String, reason: String },

    #[error("{engine} failed: {reason}")]
    Failed { engine: String, reason: String },

    #[error("{engine} produced invalid output: {reason}")]
    InvalidOutput { engine: String, reason: String },
}

/// Column an engine needs, with the value injected when the input lacks it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredColumn {
    pub name: String,
    pub default: String,
}

impl RequiredColumn {
    pub fn new(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
        }
    }
}

/// Input records written to a job-unique file, removed on drop
#[derive(Debug)]
pub struct InputBinding {
    name: String,
    path: PathBuf,
}

impl InputBinding {
    /// Write `records` as CSV under a name unique to `job_id` and `algorithm`
    pub fn bind(dir: &Path, job_id: Uuid, algorithm: Algorithm, records: &RecordTable) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let name = format!("input_{}_{}", job_id.simple(), algorithm.as_str().to_ascii_lowercase());
        let path = dir.join(format!("{}.csv", name));
        records
            .write_csv(&path)
            .map_err(|e| Error::Internal(format!("Failed to bind input {}: {}", path.display(), e)))?;
        tracing::debug!(job_id = %job_id, binding = %name, "Input bound");
        Ok(Self { name, path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InputBinding {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(binding = %self.name, error = %e, "Failed to release input binding");
            }
        }
    }
}

/// Everything one classifier call may use
pub struct Invocation<'a> {
    pub job_id: Uuid,
    pub algorithm: Algorithm,
    pub age_group: AgeGroup,
    /// Records with required columns already filled in
    pub records: &'a RecordTable,
    /// Present iff the engine asked for exclusive binding
    pub binding: Option<&'a InputBinding>,
    pub output: &'a OutputBuffer,
    pub diagnostics: &'a Diagnostics,
}

/// Per-algorithm classifier adapter
pub trait ClassifierEngine: Send + Sync {
    /// Columns the engine needs, with injected defaults
    fn required_columns(&self, age_group: AgeGroup) -> Vec<RequiredColumn> {
        let _ = age_group;
        Vec::new()
    }

    /// Whether the input must be bound to a job-unique file for the call
    fn requires_exclusive_binding(&self) -> bool {
        false
    }

    fn classify(&self, invocation: &Invocation<'_>) -> std::result::Result<Vec<CauseAssignment>, EngineError>;
}

/// Engines available to a worker, by algorithm
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<Algorithm, Arc<dyn ClassifierEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in demo engines for every algorithm
    pub fn with_demo_engines() -> Self {
        let mut registry = Self::new();
        for algorithm in Algorithm::ALL {
            registry.register(algorithm, Arc::new(DemoEngine::new(algorithm)));
        }
        registry
    }

    /// Demo engines, replaced by external command engines where configured.
    ///
    /// Keys of `engines` are algorithm names.
    pub fn from_config(engines: &std::collections::BTreeMap<String, EngineCommandConfig>) -> Result<Self> {
        let mut registry = Self::with_demo_engines();
        for (name, config) in engines {
            let algorithm: Algorithm = name
                .parse()
                .map_err(|e: String| Error::Config(format!("[engines.{}]: {}", name, e)))?;
            tracing::info!(
                algorithm = %algorithm,
                program = %config.program.display(),
                "Using external command engine"
            );
            registry.register(algorithm, Arc::new(CommandEngine::from_config(algorithm, config)));
        }
        Ok(registry)
    }

    pub fn register(&mut self, algorithm: Algorithm, engine: Arc<dyn ClassifierEngine>) {
        self.engines.insert(algorithm, engine);
    }

    pub fn get(&self, algorithm: Algorithm) -> Option<Arc<dyn ClassifierEngine>> {
        self.engines.get(&algorithm).cloned()
    }
}
