//! Durable state repositories.
//!
//! Four logical stores (queue, registry, products, jobs) back the control
//! plane, each an SQLite file under the configured state directory. The
//! dead-letter and circuit-breaker tables share the jobs file but are
//! exposed through their own handles. Writes are serialised per store
//! through a store-scoped lock; readers run unbounded against committed
//! state. Every operation carries an upper-bound timeout and fails
//! `StoreUnavailable` when it elapses, so callers may retry.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{PipelineError, Result};

pub mod dlq;
pub mod jobs;
pub mod products;
pub mod queue;
pub mod registry;

pub use dlq::{DeadLetterStore, DlqFilter, DlqRecord, DlqStatus, NewDlqItem};
pub use jobs::{
    JobLogLine, JobLogWriter, JobPatch, JobRecord, JobStatus, JobStore, NewStageExecution,
    StageExecutionRecord,
};
pub use products::{ImageRecord, MsRecord, MsStage, ProductFilter, ProductStore};
pub use queue::{
    ArrivalOutcome, GroupClaim, GroupFilter, GroupRow, GroupSnapshot, GroupState, QueueStore,
    RequeueOutcome, SubbandFile,
};
pub use registry::{RegisterOutcome, RegistryStore};

/// Upper bound applied to every repository operation.
pub(crate) const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Store-scoped write serialisation. Multiple writers (ingest watcher and
/// job runner both touch the queue) acquire this lock in call order; there
/// are no cross-store transactions to order against.
pub(crate) type WriteLock = Arc<Mutex<()>>;

/// Bundle of opened store handles shared across the control plane.
#[derive(Clone, Debug)]
pub struct StoreSet {
    pub queue: QueueStore,
    pub registry: RegistryStore,
    pub products: ProductStore,
    pub jobs: JobStore,
    pub dlq: DeadLetterStore,
}

impl StoreSet {
    /// Open (creating if necessary) all stores under `state_dir`.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let queue = QueueStore::open(&state_dir.join("queue.db")).await?;
        let registry = RegistryStore::open(&state_dir.join("registry.db")).await?;
        let products = ProductStore::open(&state_dir.join("products.db")).await?;
        let jobs = JobStore::open(&state_dir.join("jobs.db")).await?;
        let dlq = DeadLetterStore::attach(&jobs);
        info!(state_dir = %state_dir.display(), "state stores opened");
        Ok(Self {
            queue,
            registry,
            products,
            jobs,
            dlq,
        })
    }
}

/// Open an SQLite pool with the settings shared by every store.
pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| {
            PipelineError::StoreUnavailable(format!("open {}: {e}", path.display()))
        })
}

/// Classify an sqlx error at the repository boundary.
///
/// Constraint failures are fatal to the operation; everything else is
/// reported as store unavailability, which the default retry predicate
/// treats as transient.
pub(crate) fn classify(op: &str, err: sqlx::Error) -> PipelineError {
    match err {
        sqlx::Error::RowNotFound => PipelineError::NotFound(op.to_string()),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation()
            {
                PipelineError::ConstraintViolation(format!("{op}: {db}"))
            } else {
                PipelineError::StoreUnavailable(format!("{op}: {db}"))
            }
        }
        other => PipelineError::StoreUnavailable(format!("{op}: {other}")),
    }
}

/// Run a store operation under the repository timeout.
pub(crate) async fn with_op_timeout<T, F>(op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(STORE_OP_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::StoreUnavailable(format!(
            "{op}: timed out after {}s",
            STORE_OP_TIMEOUT.as_secs()
        ))),
    }
}
