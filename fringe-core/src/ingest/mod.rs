//! Ingest pipeline: file arrivals become observation groups ready for
//! processing.
//!
//! The watcher (realtime notifications plus a periodic rescan backstop)
//! feeds every candidate path through the [`Ingestor`], which applies the
//! filename convention and records arrivals in the queue store. The
//! [`IngestHousekeeper`] drives the timeout transitions of the group
//! state machine on a fixed cadence.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::Result;
use crate::store::{ArrivalOutcome, QueueStore};

pub mod pattern;
pub mod watcher;

pub use pattern::{FilenamePattern, SubbandKey};
pub use watcher::IngestWatcher;

/// Applies the filename convention and records arrivals.
#[derive(Clone, Debug)]
pub struct Ingestor {
    queue: QueueStore,
    pattern: FilenamePattern,
    expected_subbands: u32,
}

impl Ingestor {
    pub fn new(queue: QueueStore, config: &IngestConfig) -> Result<Self> {
        Ok(Self {
            queue,
            pattern: FilenamePattern::new(&config.filename_regex)?,
            expected_subbands: config.expected_subbands,
        })
    }

    /// Record one observed file. Returns `None` when the name does not
    /// match the convention.
    pub async fn observe_file(&self, path: &Path) -> Result<Option<ArrivalOutcome>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(key) = self.pattern.parse(name) else {
            debug!(file = name, "ignoring non-matching file");
            return Ok(None);
        };
        let outcome = self
            .queue
            .record_file_arrival(
                &key.group_id,
                key.subband_index,
                &path.to_string_lossy(),
                self.expected_subbands,
            )
            .await?;
        if outcome.promoted {
            info!(
                group_id = %outcome.group_id,
                files = outcome.file_count,
                "group complete, promoted to pending"
            );
        }
        Ok(Some(outcome))
    }
}

/// Periodic sweep applying the group timeout rules.
#[derive(Clone, Debug)]
pub struct IngestHousekeeper {
    queue: QueueStore,
    config: IngestConfig,
}

impl IngestHousekeeper {
    pub fn new(queue: QueueStore, config: IngestConfig) -> Self {
        Self { queue, config }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.housekeeper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingest housekeeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "housekeeping sweep failed");
            }
        }
    }

    /// One sweep: expire idle collecting groups, requeue or fail stalled
    /// in-progress groups.
    pub async fn sweep_once(&self) -> Result<()> {
        let expired = self
            .queue
            .expire_collecting(self.config.completion_timeout())
            .await?;
        if expired > 0 {
            warn!(expired, "failed groups that never completed collection");
        }
        let outcome = self
            .queue
            .requeue_stalled(
                self.config.inprogress_timeout(),
                self.config.max_group_attempts,
            )
            .await?;
        if outcome.requeued > 0 || outcome.failed > 0 {
            warn!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                "stalled in-progress groups swept"
            );
        }
        Ok(())
    }
}

/// Convenience wiring used by the daemon: watcher plus housekeeper.
pub fn spawn_ingest(
    ingestor: Arc<Ingestor>,
    queue: QueueStore,
    config: IngestConfig,
    input_dir: std::path::PathBuf,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let watcher = IngestWatcher::new(ingestor, input_dir, config.clone());
    let housekeeper = IngestHousekeeper::new(queue, config);
    vec![
        tokio::spawn(watcher.run(cancel.clone())),
        tokio::spawn(housekeeper.run(cancel.clone())),
    ]
}
