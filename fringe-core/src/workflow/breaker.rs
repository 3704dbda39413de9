//! Per-stage circuit breakers with durable state.
//!
//! The in-process board is authoritative while the process runs; every
//! transition is mirrored into the jobs store so breakers survive
//! restarts. A breaker opens after `failure_threshold` consecutive
//! failures, rejects execution until the recovery timeout elapses, then
//! admits one probe in half-open state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::store::jobs::{BreakerRecord, JobStore};

/// Breaker states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(PipelineError::ConstraintViolation(format!(
                "unknown breaker state `{other}`"
            ))),
        }
    }
}

/// Tuning shared by all breakers on a board.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Cooldown before an open breaker admits a probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Cell {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }
}

/// Decision returned by [`BreakerBoard::acquire`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerDecision {
    Allow,
    /// Breaker open and still cooling down.
    Rejected,
}

/// Named circuit breakers shared across workflows.
pub struct BreakerBoard {
    settings: BreakerSettings,
    cells: DashMap<String, Cell>,
    store: Option<JobStore>,
}

impl fmt::Debug for BreakerBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerBoard")
            .field("settings", &self.settings)
            .field("breakers", &self.cells.len())
            .finish()
    }
}

impl BreakerBoard {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            cells: DashMap::new(),
            store: None,
        }
    }

    /// Mirror breaker transitions into the jobs store.
    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Check whether a guarded stage may run. Open breakers whose cooldown
    /// has elapsed flip to half-open and admit one probe.
    pub async fn acquire(&self, name: &str) -> BreakerDecision {
        self.hydrate(name).await;
        let mut cell = self.cells.entry(name.to_string()).or_default();
        match cell.state {
            BreakerState::Closed | BreakerState::HalfOpen => BreakerDecision::Allow,
            BreakerState::Open => {
                let cooled = cell.last_failure.is_none_or(|at| {
                    Utc::now().signed_duration_since(at).to_std().unwrap_or_default()
                        >= self.settings.recovery_timeout
                });
                if cooled {
                    cell.state = BreakerState::HalfOpen;
                    let snapshot = *cell;
                    drop(cell);
                    info!(breaker = name, "breaker half-open, admitting probe");
                    self.persist(name, snapshot).await;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Rejected
                }
            }
        }
    }

    /// Record a successful guarded execution.
    pub async fn record_success(&self, name: &str) {
        let mut cell = self.cells.entry(name.to_string()).or_default();
        let was_open = cell.state != BreakerState::Closed;
        cell.state = BreakerState::Closed;
        cell.failure_count = 0;
        let snapshot = *cell;
        drop(cell);
        if was_open {
            info!(breaker = name, "breaker closed");
        }
        self.persist(name, snapshot).await;
    }

    /// Record a terminal failure of a guarded execution.
    pub async fn record_failure(&self, name: &str) {
        let mut cell = self.cells.entry(name.to_string()).or_default();
        cell.failure_count += 1;
        cell.last_failure = Some(Utc::now());
        // A half-open probe failing reopens immediately.
        if cell.state == BreakerState::HalfOpen
            || cell.failure_count >= self.settings.failure_threshold
        {
            if cell.state != BreakerState::Open {
                warn!(
                    breaker = name,
                    failures = cell.failure_count,
                    "breaker opened"
                );
            }
            cell.state = BreakerState::Open;
        }
        let snapshot = *cell;
        drop(cell);
        self.persist(name, snapshot).await;
    }

    pub fn state(&self, name: &str) -> BreakerState {
        self.cells
            .get(name)
            .map(|cell| cell.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Load durable state on first touch of a breaker name.
    async fn hydrate(&self, name: &str) {
        if self.cells.contains_key(name) {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        match store.load_breaker(name).await {
            Ok(Some(record)) => {
                let cell = Cell {
                    state: record.state.parse().unwrap_or(BreakerState::Closed),
                    failure_count: record.failure_count,
                    last_failure: record.last_failure_time,
                };
                self.cells.entry(name.to_string()).or_insert(cell);
            }
            Ok(None) => {}
            Err(e) => warn!(breaker = name, error = %e, "failed to hydrate breaker"),
        }
    }

    async fn persist(&self, name: &str, cell: Cell) {
        let Some(store) = &self.store else {
            return;
        };
        let record = BreakerRecord {
            name: name.to_string(),
            state: cell.state.as_str().to_string(),
            failure_count: cell.failure_count,
            last_failure_time: cell.last_failure,
            recovery_timeout_sec: self.settings.recovery_timeout.as_secs(),
        };
        if let Err(e) = store.save_breaker(&record).await {
            warn!(breaker = name, error = %e, "failed to persist breaker state");
        }
    }
}
