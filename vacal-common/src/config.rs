//! Configuration loading and data folder resolution
//!
//! Data folder resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable `VACAL_DATA_DIR`
//! 3. TOML config file `data_dir`
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing TOML file is never fatal: defaults are used and a warning is logged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the data folder
pub const DATA_DIR_ENV: &str = "VACAL_DATA_DIR";

/// Environment variable pointing at an explicit TOML config file
pub const CONFIG_PATH_ENV: &str = "VACAL_CONFIG";

/// Database file name inside the data folder
pub const DATABASE_FILE: &str = "vacal.db";

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// External command engine definition (`[engines.<Algorithm>]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCommandConfig {
    /// Executable to run (e.g. `Rscript`)
    pub program: PathBuf,

    /// Arguments placed before the generated `--input/--output/--age-group` flags
    #[serde(default)]
    pub args: Vec<String>,

    /// Columns the engine requires, with the default injected when input lacks them
    #[serde(default)]
    pub required_columns: BTreeMap<String, String>,
}

/// Calibration section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Pseudo-count weight of the misclassification prior rows
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,

    /// Optional JSON file with misclassification priors per algorithm/age group/country
    #[serde(default)]
    pub priors_path: Option<PathBuf>,

    /// Treat a combination missing from the priors file as an unavailable
    /// engine instead of falling back to parametric priors
    #[serde(default)]
    pub strict_priors: bool,
}

fn default_prior_strength() -> f64 {
    50.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            prior_strength: default_prior_strength(),
            priors_path: None,
            strict_priors: false,
        }
    }
}

/// Contents of the VACAL TOML config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Data folder holding the database and per-job artifacts
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// HTTP bind address for `serve`
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Log watcher polling interval in milliseconds
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,

    /// Program launched for each job (defaults to the running executable)
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// External classifier engines keyed by algorithm id
    #[serde(default)]
    pub engines: BTreeMap<String, EngineCommandConfig>,

    #[serde(default)]
    pub calibration: CalibrationConfig,
}

fn default_bind_address() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_log_poll_interval_ms() -> u64 {
    2000
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            bind_address: default_bind_address(),
            log_poll_interval_ms: default_log_poll_interval_ms(),
            worker_program: None,
            logging: LoggingConfig::default(),
            engines: BTreeMap::new(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Load config from an explicit path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Load config from `explicit`, `VACAL_CONFIG`, or the platform config file.
    ///
    /// Falls back to defaults (with a warning) when no file exists. A file that
    /// exists but does not parse is an error.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load(Path::new(&path));
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading config: {}", path.display());
                Self::load(&path)
            }
            _ => {
                warn!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Platform config file location (`~/.config/vacal/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vacal").join("config.toml"))
}

/// Write TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Write `config` to `path` unless a file is already there.
///
/// Returns whether the file was written. Lets a first `serve` leave behind an
/// editable config showing every setting.
pub fn write_config_if_missing(config: &TomlConfig, path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_toml_config(config, path)?;
    info!("Wrote default config: {}", path.display());
    Ok(true)
}

/// Compiled fallback values per platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub data_dir: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("vacal"))
            .unwrap_or_else(|| PathBuf::from("./vacal_data"));

        Self {
            data_dir,
            log_level: default_log_level(),
        }
    }
}

/// Resolves the data folder following the documented priority order
pub struct DataFolderResolver<'a> {
    cli_arg: Option<&'a Path>,
    toml: Option<&'a TomlConfig>,
}

impl<'a> DataFolderResolver<'a> {
    pub fn new(cli_arg: Option<&'a Path>, toml: Option<&'a TomlConfig>) -> Self {
        Self { cli_arg, toml }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = self.cli_arg {
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = self.toml.and_then(|t| t.data_dir.clone()) {
            return path;
        }

        CompiledDefaults::for_current_platform().data_dir
    }
}

/// Creates the data folder layout on first run
pub struct DataFolderInitializer {
    data_dir: PathBuf,
}

impl DataFolderInitializer {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.data_dir.exists() {
            info!("Creating data folder: {}", self.data_dir.display());
        }
        std::fs::create_dir_all(self.jobs_dir())?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Parent of the per-job artifact folders
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
}
