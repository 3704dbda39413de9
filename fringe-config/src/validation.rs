//! Guard-rail validation of a loaded configuration.

use std::fmt;

use fringe_core::ingest::FilenamePattern;
use fringe_core::PipelineConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigGuardRailError {
    #[error("{0}")]
    FilenamePattern(String),

    #[error("ingest.max_group_attempts must be at least 1")]
    ZeroGroupAttempts,

    #[error("paths.{0} must not be empty")]
    EmptyPath(&'static str),
}

/// Non-fatal findings surfaced at startup.
#[derive(Clone, Debug, Default)]
pub struct ConfigWarnings(Vec<String>);

impl ConfigWarnings {
    pub fn push(&mut self, warning: impl Into<String>) {
        self.0.push(warning.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConfigWarnings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

/// Validate hard constraints and collect soft warnings.
pub fn validate(config: &PipelineConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    FilenamePattern::new(&config.ingest.filename_regex)
        .map_err(|e| ConfigGuardRailError::FilenamePattern(e.to_string()))?;

    if config.ingest.max_group_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroGroupAttempts);
    }

    for (name, path) in [
        ("input_dir", &config.paths.input_dir),
        ("output_dir", &config.paths.output_dir),
        ("scratch_dir", &config.paths.scratch_dir),
        ("state_dir", &config.paths.state_dir),
    ] {
        if path.as_os_str().is_empty() {
            return Err(ConfigGuardRailError::EmptyPath(name));
        }
    }

    if config.ingest.expected_subbands == 0 {
        warnings.push(
            "ingest.expected_subbands is 0: groups will promote to pending on creation",
        );
    }
    if config.ingest.group_completion_timeout_sec == 0 {
        warnings.push("ingest.group_completion_timeout_sec is 0: idle groups fail immediately");
    }
    if config.orchestrator.default_retry.max_attempts == 0 {
        warnings.push("orchestrator.default_retry.max_attempts is 0: treated as a single attempt");
    }
    if config.logging.log_commit_batch_size == 0 {
        warnings.push("logging.log_commit_batch_size is 0: treated as 1");
    }
    if config.helpers.processing_enabled() {
        for (name, cmd) in [
            ("convert_cmd", &config.helpers.convert_cmd),
            ("solve_cmd", &config.helpers.solve_cmd),
            ("apply_cmd", &config.helpers.apply_cmd),
            ("image_cmd", &config.helpers.image_cmd),
        ] {
            if let Some(cmd) = cmd
                && !cmd.is_file()
            {
                warnings.push(format!(
                    "helpers.{name} {} does not exist yet",
                    cmd.display()
                ));
            }
        }
    }

    Ok(warnings)
}
