//! Tests for configuration loading and data folder resolution
//!
//! Tests that manipulate VACAL_DATA_DIR or VACAL_CONFIG are marked #[serial]
//! so they never race on the process environment.

use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;
use vacal_common::config::{
    write_config_if_missing, write_toml_config, CompiledDefaults, DataFolderInitializer, DataFolderResolver, TomlConfig,
    CONFIG_PATH_ENV, DATA_DIR_ENV,
};

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(DATA_DIR_ENV);

    let resolved = DataFolderResolver::new(None, None).resolve();
    assert_eq!(resolved, CompiledDefaults::for_current_platform().data_dir);
}

#[test]
#[serial]
fn test_env_var_wins_over_toml() {
    env::set_var(DATA_DIR_ENV, "/tmp/vacal-env-folder");
    let toml = TomlConfig {
        data_dir: Some(PathBuf::from("/tmp/vacal-toml-folder")),
        ..TomlConfig::default()
    };

    let resolved = DataFolderResolver::new(None, Some(&toml)).resolve();
    env::remove_var(DATA_DIR_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/vacal-env-folder"));
}

#[test]
#[serial]
fn test_toml_used_when_env_absent() {
    env::remove_var(DATA_DIR_ENV);
    let toml = TomlConfig {
        data_dir: Some(PathBuf::from("/tmp/vacal-toml-folder")),
        ..TomlConfig::default()
    };

    let resolved = DataFolderResolver::new(None, Some(&toml)).resolve();
    assert_eq!(resolved, PathBuf::from("/tmp/vacal-toml-folder"));
}

#[test]
#[serial]
fn test_load_from_env_config_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "log_poll_interval_ms = 100\n").unwrap();

    env::set_var(CONFIG_PATH_ENV, &path);
    let config = TomlConfig::load_or_default(None);
    env::remove_var(CONFIG_PATH_ENV);

    assert_eq!(config.unwrap().log_poll_interval_ms, 100);
}

#[test]
fn test_malformed_toml_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "log_poll_interval_ms = \"often\"\n").unwrap();

    assert!(TomlConfig::load(&path).is_err());
}

#[test]
fn test_atomic_write_round_trips_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.data_dir = Some(PathBuf::from("/srv/vacal"));
    config.calibration.prior_strength = 20.0;

    write_toml_config(&config, &target).unwrap();

    assert!(target.exists());
    assert!(!target.with_extension("toml.tmp").exists());
    assert_eq!(TomlConfig::load(&target).unwrap(), config);
}

#[test]
fn test_default_config_written_only_once() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("vacal").join("config.toml");

    assert!(write_config_if_missing(&TomlConfig::default(), &target).unwrap());
    assert_eq!(TomlConfig::load(&target).unwrap(), TomlConfig::default());

    // An existing file, even one the user edited, is left alone
    std::fs::write(&target, "bind_address = \"0.0.0.0:9000\"\n").unwrap();
    assert!(!write_config_if_missing(&TomlConfig::default(), &target).unwrap());
    assert_eq!(TomlConfig::load(&target).unwrap().bind_address, "0.0.0.0:9000");
}

#[test]
fn test_initializer_creates_jobs_folder() {
    let dir = TempDir::new().unwrap();
    let init = DataFolderInitializer::new(dir.path().join("data"));

    init.ensure_directory_exists().unwrap();

    assert!(init.jobs_dir().is_dir());
    assert_eq!(init.database_path(), dir.path().join("data").join("vacal.db"));
}
