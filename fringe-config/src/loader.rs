//! Layered configuration loading.
//!
//! Evaluation order:
//! 1) explicit path handed to [`load_from`] (or `$FRINGE_CONFIG`),
//! 2) `fringe.toml` in the working directory, when present,
//! 3) built-in defaults,
//! with `FRINGE__SECTION__KEY` environment variables layered on top.

use std::env;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use fringe_core::PipelineConfig;
use thiserror::Error;
use tracing::info;

use crate::validation::{self, ConfigWarnings};

const ENV_CONFIG_PATH: &str = "FRINGE_CONFIG";
const DEFAULT_FILE: &str = "fringe.toml";
const ENV_PREFIX: &str = "FRINGE";

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("configuration file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the effective configuration came from.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Defaults,
    EnvPath(PathBuf),
    File(PathBuf),
}

/// A loaded and validated configuration.
#[derive(Clone, Debug)]
pub struct ConfigLoad {
    pub config: PipelineConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

/// Load using the default search order.
pub fn load() -> Result<ConfigLoad, ConfigLoadError> {
    if let Ok(path) = env::var(ENV_CONFIG_PATH)
        && !path.trim().is_empty()
    {
        let path = PathBuf::from(path);
        return finish(build(Some(&path))?, ConfigSource::EnvPath(path));
    }
    let default = Path::new(DEFAULT_FILE);
    if default.is_file() {
        return finish(
            build(Some(default))?,
            ConfigSource::File(default.to_path_buf()),
        );
    }
    finish(build(None)?, ConfigSource::Defaults)
}

/// Load from an explicit file.
pub fn load_from(path: &Path) -> Result<ConfigLoad, ConfigLoadError> {
    if !path.is_file() {
        return Err(ConfigLoadError::MissingFile(path.to_path_buf()));
    }
    finish(build(Some(path))?, ConfigSource::File(path.to_path_buf()))
}

fn build(file: Option<&Path>) -> Result<PipelineConfig, ConfigLoadError> {
    let mut builder = Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(
            File::from(path.to_path_buf())
                .format(FileFormat::Toml)
                .required(true),
        );
    }
    let settings = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

fn finish(config: PipelineConfig, source: ConfigSource) -> Result<ConfigLoad, ConfigLoadError> {
    let warnings =
        validation::validate(&config).map_err(|e| ConfigLoadError::Invalid(e.to_string()))?;
    for warning in warnings.iter() {
        tracing::warn!(warning, "configuration warning");
    }
    info!(?source, "configuration loaded");
    Ok(ConfigLoad {
        config,
        source,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_load_and_validate() {
        let loaded = finish(PipelineConfig::default(), ConfigSource::Defaults).unwrap();
        assert_eq!(loaded.source, ConfigSource::Defaults);
        assert_eq!(loaded.config.ingest.expected_subbands, 16);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[ingest]\nexpected_subbands = 8\n\n[orchestrator.default_retry]\nmax_attempts = 5\n"
        )
        .unwrap();
        let loaded = load_from(file.path()).unwrap();
        assert_eq!(loaded.config.ingest.expected_subbands, 8);
        assert_eq!(loaded.config.orchestrator.default_retry.max_attempts, 5);
        // Untouched sections keep their defaults.
        assert_eq!(loaded.config.resources.max_worker_stages, 4);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_from(Path::new("/nonexistent/fringe.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingFile(_)));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[ingest]\nfilename_regex = \"(unclosed\"\n").unwrap();
        let err = load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
    }
}
