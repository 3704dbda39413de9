//! External collaborator interfaces.
//!
//! The scientific routines (format decoding, calibration solving and
//! application, imaging) live outside the control plane; stages reach
//! them only through these traits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::cal::{CalKind, CaltableRef};
use crate::error::Result;
use crate::stage::ValueMap;

/// Sub-band files to measurement set conversion.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        start_mjd: f64,
        end_mjd: f64,
        writer: &str,
        workers: usize,
    ) -> Result<PathBuf>;
}

/// A solved calibration table produced by the solver.
#[derive(Clone, Debug, PartialEq)]
pub struct SolvedTable {
    pub path: PathBuf,
    pub apply_order: i32,
}

/// Calibration solver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CalSolver: Send + Sync {
    async fn solve(&self, ms_path: &Path, kind: CalKind, params: &ValueMap)
        -> Result<SolvedTable>;
}

/// Calibration applier. May annotate the measurement set in place or
/// produce a new one; the returned path is authoritative either way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CalApplier: Send + Sync {
    async fn apply(&self, ms_path: &Path, tables: &[CaltableRef]) -> Result<PathBuf>;
}

/// Imaging result metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub beam: f64,
    pub noise: f64,
    pub pbcor: bool,
}

/// Imager.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Imager: Send + Sync {
    async fn image(&self, ms_path: &Path, params: &ValueMap) -> Result<ImageArtifact>;
}
