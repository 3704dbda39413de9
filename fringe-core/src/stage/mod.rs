//! Stage contract: the capability set every workflow node implements.

use async_trait::async_trait;

use crate::error::Result;

pub mod context;
pub mod isolated;
pub mod observer;

pub use context::{Context, ContextData, Value, ValueMap};
pub use isolated::IsolatedCommandStage;
pub use observer::{NoopStageObserver, StageObserver, TracingStageObserver};

/// How the orchestrator hosts a stage body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum ExecutionMode {
    /// In-process execution.
    #[default]
    Direct,
    /// Spawned external helper reporting structured outputs.
    Isolated,
}

/// Outcome of a prerequisite check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    /// Prerequisites missing; the orchestrator skips the stage with the
    /// given reason.
    NotReady(String),
}

impl Readiness {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Readiness::NotReady(reason.into())
    }
}

/// One node of a workflow.
///
/// `validate` is a side-effect-free prerequisite check. `execute` may
/// perform long I/O; it must leave the input context untouched and return
/// a derived context carrying its produced outputs. `cleanup` is an
/// idempotent, best-effort finaliser invoked after the last attempt and on
/// cancellation.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name; unique within a workflow.
    fn name(&self) -> &str;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Direct
    }

    async fn validate(&self, _ctx: &Context) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context>;

    async fn cleanup(&self, _ctx: &Context) {}
}
