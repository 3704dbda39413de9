//! Input directory watcher.
//!
//! A thin wrapper around `notify` that debounces raw filesystem
//! notifications into batches before handing paths to the [`Ingestor`].
//! A periodic full rescan backstops the realtime watcher: arrivals are
//! idempotent in the queue store, so sweeping the directory again is
//! always safe, and it covers filesystems without usable notifications.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use notify::event::EventKind;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;

use super::Ingestor;

/// Watches the flat input directory and feeds arrivals to the ingestor.
#[derive(Debug)]
pub struct IngestWatcher {
    ingestor: Arc<Ingestor>,
    input_dir: PathBuf,
    config: IngestConfig,
}

impl IngestWatcher {
    pub fn new(ingestor: Arc<Ingestor>, input_dir: PathBuf, config: IngestConfig) -> Self {
        Self {
            ingestor,
            input_dir,
            config,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        // Keep the watcher alive for the duration of the loop; losing it
        // silently degrades to polling only.
        let _watcher = match RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            NotifyConfig::default(),
        ) {
            Ok(mut watcher) => match watcher.watch(&self.input_dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(dir = %self.input_dir.display(), "watching input directory");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "failed to watch input directory, polling only");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to create filesystem watcher, polling only");
                None
            }
        };

        // Seed the queue from whatever is already on disk.
        self.rescan().await;

        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let mut watch_alive = true;
        let mut flush_tick = tokio::time::interval(self.config.debounce_window());
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rescan_tick = tokio::time::interval(self.config.rescan_interval());
        rescan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush(&mut pending).await;
                    info!("ingest watcher stopping");
                    return;
                }
                event = rx.recv(), if watch_alive => match event {
                    Some(Ok(event)) => self.collect(event, &mut pending),
                    Some(Err(e)) => {
                        // Notification stream hiccup; the rescan will
                        // pick up anything we missed.
                        warn!(error = %e, "watch error");
                    }
                    None => {
                        warn!("watch channel closed, polling only");
                        watch_alive = false;
                    }
                },
                _ = flush_tick.tick() => self.flush(&mut pending).await,
                _ = rescan_tick.tick() => self.rescan().await,
            }
        }
    }

    fn collect(&self, event: Event, pending: &mut BTreeSet<PathBuf>) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            pending.insert(path);
        }
    }

    async fn flush(&self, pending: &mut BTreeSet<PathBuf>) {
        for path in std::mem::take(pending) {
            if !path.is_file() {
                continue;
            }
            if let Err(e) = self.ingestor.observe_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to record arrival");
            }
        }
    }

    /// Full sweep of the input directory.
    async fn rescan(&self) {
        debug!(dir = %self.input_dir.display(), "rescanning input directory");
        let mut entries = match tokio::fs::read_dir(&self.input_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.input_dir.display(), error = %e, "rescan failed");
                return;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    if let Err(e) = self.ingestor.observe_file(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to record arrival");
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "rescan interrupted");
                    return;
                }
            }
        }
    }
}
