//! # Fringe Daemon
//!
//! Single-host pipeline daemon for the Fringe imaging pipeline:
//!
//! - watches the input directory and assembles sub-band arrivals into
//!   observation groups,
//! - sweeps group timeouts (collection expiry, stalled re-queues),
//! - claims pending groups and drives each through the standard imaging
//!   workflow, with the scientific steps bound to configured helper
//!   commands through the collaborator adapters,
//! - shuts down cleanly on SIGINT, handing in-flight groups back to the
//!   queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fringe_core::stages::{calibrator_workflow, imaging_workflow, ScienceDeps};
use fringe_core::workflow::Orchestrator;
use fringe_core::{
    GroupProcessor, Ingestor, JobRunner, StoreSet, WorkflowRegistry,
};

/// Command line arguments for the Fringe pipeline daemon.
#[derive(Parser, Debug)]
#[command(name = "fringed")]
#[command(about = "Fringe imaging pipeline daemon")]
struct Args {
    /// Path to the configuration file (TOML). Falls back to FRINGE_CONFIG
    /// and then ./fringe.toml.
    #[arg(long, env = "FRINGE_CONFIG")]
    config: Option<PathBuf>,

    /// Tracing filter, e.g. `info` or `fringe_core=debug`.
    #[arg(long, env = "FRINGE_LOG", default_value = "info")]
    log: String,

    /// Record arrivals and run housekeeping, but do not process groups.
    #[arg(long)]
    ingest_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let loaded = match &args.config {
        Some(path) => fringe_config::load_from(path),
        None => fringe_config::load(),
    }
    .context("failed to load configuration")?;
    let config = Arc::new(loaded.config);

    for dir in [
        &config.paths.input_dir,
        &config.paths.output_dir,
        &config.paths.scratch_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let stores = StoreSet::open(&config.paths.state_dir)
        .await
        .context("failed to open state stores")?;

    let cancel = CancellationToken::new();
    let ingestor = Arc::new(
        Ingestor::new(stores.queue.clone(), &config.ingest)
            .context("failed to build ingestor")?,
    );
    let mut tasks = fringe_core::ingest::spawn_ingest(
        ingestor,
        stores.queue.clone(),
        config.ingest.clone(),
        config.paths.input_dir.clone(),
        &cancel,
    );

    if !args.ingest_only && config.helpers.processing_enabled() {
        // Bind the collaborator interfaces to the configured helper
        // commands: the built-in stages then run unchanged, including the
        // apply stage's calibration-registry lookup.
        let deps = ScienceDeps::from_helpers(&config.helpers)
            .context("helper commands incomplete")?;
        let mut registry = WorkflowRegistry::new();
        registry.register(imaging_workflow(&deps, &config));
        registry.register(calibrator_workflow(&deps, &config));
        let orchestrator = Arc::new(
            Orchestrator::from_config(&config).with_stores(stores.clone()),
        );
        let runner = JobRunner::new(
            config.clone(),
            stores.clone(),
            Arc::new(registry),
            orchestrator,
        );
        let processor = GroupProcessor::new(runner, stores.queue.clone(), "imaging");
        tasks.push(tokio::spawn(processor.run(cancel.clone())));
        info!("group processing enabled");
    } else {
        warn!("group processing disabled (ingest-only mode or helpers not configured)");
    }

    info!("fringed running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .is_err()
        {
            warn!("task did not stop within the shutdown grace period");
        }
    }
    info!("fringed stopped");
    Ok(())
}
