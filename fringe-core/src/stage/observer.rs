//! Observer hooks for stage transitions.

use std::time::Duration;

use crate::error::PipelineError;

/// Synchronous hooks invoked by the orchestrator at each stage
/// transition. All methods default to no-ops so observers implement only
/// what they need.
pub trait StageObserver: Send + Sync {
    fn stage_started(&self, _job_id: Option<i64>, _stage: &str) {}

    fn stage_completed(&self, _job_id: Option<i64>, _stage: &str, _duration: Duration) {}

    fn stage_failed(&self, _job_id: Option<i64>, _stage: &str, _error: &PipelineError) {}

    fn stage_skipped(&self, _job_id: Option<i64>, _stage: &str, _reason: &str) {}

    /// Progress reports from isolated stages.
    fn stage_progress(&self, _job_id: Option<i64>, _stage: &str, _message: &str) {}
}

/// Observer used when no instrumentation is wired up.
#[derive(Debug, Default)]
pub struct NoopStageObserver;

impl StageObserver for NoopStageObserver {}

/// Observer that forwards every transition to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingStageObserver;

impl StageObserver for TracingStageObserver {
    fn stage_started(&self, job_id: Option<i64>, stage: &str) {
        tracing::info!(job_id, stage, "stage started");
    }

    fn stage_completed(&self, job_id: Option<i64>, stage: &str, duration: Duration) {
        tracing::info!(job_id, stage, duration_ms = duration.as_millis() as u64, "stage completed");
    }

    fn stage_failed(&self, job_id: Option<i64>, stage: &str, error: &PipelineError) {
        tracing::error!(job_id, stage, error = %error, "stage failed");
    }

    fn stage_skipped(&self, job_id: Option<i64>, stage: &str, reason: &str) {
        tracing::warn!(job_id, stage, reason, "stage skipped");
    }

    fn stage_progress(&self, job_id: Option<i64>, stage: &str, message: &str) {
        tracing::debug!(job_id, stage, message, "stage progress");
    }
}
