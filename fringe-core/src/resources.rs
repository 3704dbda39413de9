//! Scoped temp and scratch directory management.
//!
//! A manager is created per job. `temp_dir` hands out ephemeral
//! directories that disappear when their guard drops, so stage failure and
//! cancellation release them like normal completion does. `scratch_dir`
//! is created once and reused between stages of the same job. The manager
//! keeps a LIFO stack of everything it created and `release_all` (also run
//! on drop) tears the survivors down in reverse order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::Result;

/// Per-job resource manager.
pub struct ResourceManager {
    scratch_root: PathBuf,
    label: String,
    inner: Mutex<Inner>,
}

struct Inner {
    stack: Vec<Weak<TempDir>>,
    scratch: Option<PathBuf>,
}

/// Guard over an ephemeral directory. Dropping the guard removes the
/// directory.
pub struct ScopedDir {
    path: PathBuf,
    _dir: Arc<TempDir>,
}

impl ScopedDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for ScopedDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedDir").field("path", &self.path).finish()
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("scratch_root", &self.scratch_root)
            .field("label", &self.label)
            .finish()
    }
}

impl ResourceManager {
    /// Manager scoped to one job (or any other unit of work).
    pub fn for_job(scratch_root: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            label: label.into(),
            inner: Mutex::new(Inner {
                stack: Vec::new(),
                scratch: None,
            }),
        }
    }

    /// An ephemeral directory released when the returned guard drops.
    pub fn temp_dir(&self, prefix: &str) -> Result<ScopedDir> {
        std::fs::create_dir_all(&self.scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir_in(&self.scratch_root)?;
        let path = dir.path().to_path_buf();
        let dir = Arc::new(dir);
        if let Ok(mut inner) = self.inner.lock() {
            inner.stack.push(Arc::downgrade(&dir));
        }
        debug!(path = %path.display(), "temp dir acquired");
        Ok(ScopedDir { path, _dir: dir })
    }

    /// The job's scratch directory, created on first use and reused by
    /// every later stage of the job.
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(path) = &inner.scratch {
            return Ok(path.clone());
        }
        let path = self.scratch_root.join(format!("scratch-{}", self.label));
        std::fs::create_dir_all(&path)?;
        inner.scratch = Some(path.clone());
        Ok(path)
    }

    /// Release everything still held, most recent first. Ephemeral dirs
    /// whose guards already dropped are skipped.
    pub fn release_all(&self) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(weak) = inner.stack.pop() {
            if let Some(dir) = weak.upgrade() {
                debug!(path = %dir.path().display(), "releasing temp dir");
                drop(dir);
            }
        }
        if let Some(scratch) = inner.scratch.take() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                warn!(path = %scratch.display(), error = %e, "failed to remove scratch dir");
            }
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
