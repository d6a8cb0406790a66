//! Service configuration for vacal-jobs
//!
//! Built from the TOML config and the resolved data folder. Shared by `serve`
//! and `worker` so both processes agree on where jobs live.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vacal_common::config::{
    CalibrationConfig, DataFolderInitializer, DataFolderResolver, EngineCommandConfig, TomlConfig,
};
use vacal_common::Result;

use crate::calibration::{GibbsEngine, JsonPriors, ParametricPriors, PriorProvider};
use crate::engines::EngineRegistry;

/// Scratch output buffer inside a job folder
pub const SCRATCH_FILE: &str = "output.log";

/// Worker process stderr inside a job folder
pub const WORKER_LOG_FILE: &str = "worker.log";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub jobs_dir: PathBuf,
    pub bind_address: String,
    pub log_poll_interval: Duration,
    /// Program launched per job; `None` means the running executable
    pub worker_program: Option<PathBuf>,
    /// Explicit config file, forwarded to workers
    pub config_path: Option<PathBuf>,
    pub engines: BTreeMap<String, EngineCommandConfig>,
    pub calibration: CalibrationConfig,
}

impl ServiceConfig {
    /// Load TOML, resolve the data folder and create its layout
    pub fn resolve(cli_data_dir: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let toml = TomlConfig::load_or_default(config_path)?;
        Self::resolve_from(&toml, cli_data_dir, config_path)
    }

    /// Same as [`ServiceConfig::resolve`] with an already loaded TOML config
    pub fn resolve_from(
        toml: &TomlConfig,
        cli_data_dir: Option<&Path>,
        config_path: Option<&Path>,
    ) -> Result<Self> {
        let data_dir = DataFolderResolver::new(cli_data_dir, Some(toml)).resolve();
        let mut config = Self::from_toml(data_dir, toml);
        config.config_path = config_path.map(Path::to_path_buf);

        DataFolderInitializer::new(config.data_dir.clone()).ensure_directory_exists()?;
        tracing::info!(data_dir = %config.data_dir.display(), "Data folder resolved");
        Ok(config)
    }

    pub fn from_toml(data_dir: PathBuf, toml: &TomlConfig) -> Self {
        let layout = DataFolderInitializer::new(data_dir.clone());
        Self {
            database_path: layout.database_path(),
            jobs_dir: layout.jobs_dir(),
            data_dir,
            bind_address: toml.bind_address.clone(),
            log_poll_interval: Duration::from_millis(toml.log_poll_interval_ms.max(1)),
            worker_program: toml.worker_program.clone(),
            config_path: None,
            engines: toml.engines.clone(),
            calibration: toml.calibration.clone(),
        }
    }

    /// Defaults rooted at `data_dir`
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::from_toml(data_dir.to_path_buf(), &TomlConfig::default())
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.jobs_dir.join(job_id.to_string())
    }

    pub fn scratch_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join(SCRATCH_FILE)
    }

    pub fn worker_log_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join(WORKER_LOG_FILE)
    }

    pub fn engine_registry(&self) -> Result<EngineRegistry> {
        EngineRegistry::from_config(&self.engines)
    }

    pub fn calibration_engine(&self) -> Result<GibbsEngine> {
        let priors: Arc<dyn PriorProvider> = match &self.calibration.priors_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading misclassification priors");
                Arc::new(JsonPriors::load(path)?.strict(self.calibration.strict_priors))
            }
            None => Arc::new(ParametricPriors),
        };
        Ok(GibbsEngine::new(priors, self.calibration.prior_strength))
    }
}
