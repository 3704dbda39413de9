//! Declarative workflows: a DAG of stages with retry, timeout, and
//! failure-policy configuration, executed by the [`Orchestrator`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::WorkflowPolicy;
use crate::stage::{Stage, ValueMap};

pub mod breaker;
pub mod dag;
pub mod executor;
pub mod retry;

pub use breaker::{BreakerBoard, BreakerDecision, BreakerSettings, BreakerState};
pub use executor::Orchestrator;
pub use retry::{Backoff, RetryPolicy};

/// One stage definition inside a workflow.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub stage: Arc<dyn Stage>,
    pub depends_on: Vec<String>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    /// Name of the circuit breaker guarding this stage, if any.
    pub breaker: Option<String>,
    /// Treat an attempt timeout as fatal instead of retryable.
    pub timeout_is_fatal: bool,
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl StageSpec {
    pub fn new(stage: Arc<dyn Stage>) -> Self {
        let name = stage.name().to_string();
        Self {
            name,
            stage,
            depends_on: Vec::new(),
            retry: None,
            timeout: None,
            breaker: None,
            timeout_is_fatal: false,
        }
    }

    /// Declare dependencies by stage name.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    pub fn fatal_timeout(mut self) -> Self {
        self.timeout_is_fatal = true;
        self
    }
}

/// A named DAG of stages.
#[derive(Clone, Debug)]
pub struct Workflow {
    pub name: String,
    pub stages: Vec<StageSpec>,
    pub policy: WorkflowPolicy,
    /// Allow dependency-free stages to run concurrently. Default is the
    /// deterministic sequential topological order.
    pub parallel: bool,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            policy: WorkflowPolicy::default(),
            parallel: false,
        }
    }

    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    pub fn policy(mut self, policy: WorkflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Terminal state of one stage in a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// Terminal state of a workflow run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowStatus {
    Completed,
    /// Some stages failed or were skipped, but the workflow policy allowed
    /// the run to continue to the end.
    PartiallyCompleted,
    Failed,
}

/// Per-stage record of a run.
#[derive(Clone, Debug)]
pub struct StageOutcome {
    pub status: StageStatus,
    /// Executed attempts; zero for skipped stages.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub outputs: ValueMap,
}

impl StageOutcome {
    /// Retries consumed beyond the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Result of a workflow run.
#[derive(Clone, Debug)]
pub struct WorkflowRun {
    pub status: WorkflowStatus,
    pub stages: BTreeMap<String, StageOutcome>,
    /// The final context, carrying the merged outputs of every completed
    /// stage.
    pub context: crate::stage::Context,
}
