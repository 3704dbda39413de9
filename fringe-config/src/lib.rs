//! Shared configuration loading for Fringe.
//!
//! Centralises how the daemon (and embedding tools) obtain a
//! [`PipelineConfig`]: defaults, an optional TOML file, and `FRINGE__*`
//! environment overrides, layered in that order, followed by guard-rail
//! validation so a bad deployment fails at startup rather than mid-run.

pub mod loader;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigSource, load, load_from};
pub use validation::{validate, ConfigGuardRailError, ConfigWarnings};
