//! Workflow executor: topological stage dispatch with retries, skip
//! semantics, circuit breakers, timeouts, cancellation, and DLQ
//! forwarding.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, WorkflowPolicy};
use crate::error::{PipelineError, Result};
use crate::stage::{Context, Readiness, StageObserver, Value, ValueMap};
use crate::store::{NewDlqItem, NewStageExecution, StoreSet};

use super::breaker::{BreakerBoard, BreakerDecision, BreakerSettings};
use super::dag::topological_order;
use super::retry::RetryPolicy;
use super::{StageOutcome, StageSpec, StageStatus, Workflow, WorkflowRun, WorkflowStatus};

/// Drives workflows to completion.
///
/// One orchestrator is shared across jobs; per-run state lives on the
/// stack of [`Orchestrator::run`].
#[derive(Clone)]
pub struct Orchestrator {
    observer: Arc<dyn StageObserver>,
    breakers: Arc<BreakerBoard>,
    stores: Option<StoreSet>,
    default_retry: RetryPolicy,
    default_timeout: Option<Duration>,
    max_parallel: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("default_retry", &self.default_retry)
            .field("default_timeout", &self.default_timeout)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            observer: Arc::new(crate::stage::NoopStageObserver),
            breakers: Arc::new(BreakerBoard::new(BreakerSettings::default())),
            stores: None,
            default_retry: RetryPolicy::default(),
            default_timeout: None,
            max_parallel: 4,
        }
    }

    /// Orchestrator honouring the configuration tree defaults.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            default_retry: RetryPolicy::from_config(&config.orchestrator.default_retry),
            default_timeout: config.resources.stage_default_timeout(),
            max_parallel: config.resources.max_worker_stages.max(1),
            ..Self::new()
        }
    }

    /// Wire the durable stores: stage executions, DLQ items, and breaker
    /// state all land there.
    pub fn with_stores(mut self, stores: StoreSet) -> Self {
        self.breakers =
            Arc::new(BreakerBoard::new(BreakerSettings::default()).with_store(stores.jobs.clone()));
        self.stores = Some(stores);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerBoard>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerBoard> {
        &self.breakers
    }

    /// Execute `workflow` against `ctx`.
    ///
    /// Static workflow defects surface as `WorkflowInvalid` and
    /// cancellation as `Cancelled`; stage failures are reported through
    /// the returned [`WorkflowRun`].
    pub async fn run(
        &self,
        workflow: &Workflow,
        ctx: Context,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun> {
        let order = topological_order(&workflow.stages)?;
        debug!(workflow = %workflow.name, stages = order.len(), "workflow start");

        let mut outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
        let mut running = ctx;
        let mut stopped: Option<String> = None;

        if workflow.parallel {
            self.run_parallel(workflow, order, &mut outcomes, &mut running, &mut stopped, cancel)
                .await?;
        } else {
            for idx in order {
                let spec = &workflow.stages[idx];
                let outcome = self
                    .run_stage(spec, &running, &outcomes, &stopped, cancel)
                    .await?;
                if outcome.status == StageStatus::Completed {
                    running = running.with_outputs(outcome.outputs.clone());
                } else if outcome.status == StageStatus::Failed
                    && workflow.policy == WorkflowPolicy::StopOnFirstFailure
                {
                    stopped = Some(spec.name.clone());
                }
                outcomes.insert(spec.name.clone(), outcome);
            }
        }

        let status = compute_status(workflow.policy, &outcomes);
        debug!(workflow = %workflow.name, ?status, "workflow finished");
        Ok(WorkflowRun {
            status,
            stages: outcomes,
            context: running,
        })
    }

    async fn run_parallel(
        &self,
        workflow: &Workflow,
        order: Vec<usize>,
        outcomes: &mut BTreeMap<String, StageOutcome>,
        running: &mut Context,
        stopped: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_parallel));
        let mut remaining = order;
        while !remaining.is_empty() {
            let (wave, rest): (Vec<usize>, Vec<usize>) = remaining.into_iter().partition(|i| {
                workflow.stages[*i]
                    .depends_on
                    .iter()
                    .all(|dep| outcomes.contains_key(dep.as_str()))
            });
            remaining = rest;

            let mut join_set: JoinSet<Result<(String, StageOutcome)>> = JoinSet::new();
            for idx in &wave {
                let this = self.clone();
                let spec = workflow.stages[*idx].clone();
                let ctx = running.clone();
                let snapshot = outcomes.clone();
                let stopped_at = stopped.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| PipelineError::Cancelled("worker pool closed".into()))?;
                    let outcome = this
                        .run_stage(&spec, &ctx, &snapshot, &stopped_at, &cancel)
                        .await?;
                    Ok((spec.name.clone(), outcome))
                });
            }

            let mut wave_outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
            let mut first_error: Option<PipelineError> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok((name, outcome))) => {
                        wave_outcomes.insert(name, outcome);
                    }
                    Ok(Err(e)) => first_error = first_error.or(Some(e)),
                    Err(join_err) => {
                        first_error = first_error
                            .or(Some(PipelineError::Fatal(format!("stage task panicked: {join_err}"))))
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            // Merge in deterministic (name) order; completion order within
            // the wave is unspecified.
            for (name, outcome) in wave_outcomes {
                if outcome.status == StageStatus::Completed {
                    *running = running.with_outputs(outcome.outputs.clone());
                } else if outcome.status == StageStatus::Failed
                    && workflow.policy == WorkflowPolicy::StopOnFirstFailure
                    && stopped.is_none()
                {
                    *stopped = Some(name.clone());
                }
                outcomes.insert(name, outcome);
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        spec: &StageSpec,
        ctx: &Context,
        outcomes: &BTreeMap<String, StageOutcome>,
        stopped: &Option<String>,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        // Skip checks, in precedence order: failed prerequisites, a
        // stopped workflow, an open breaker, then the stage's own
        // validation.
        if let Some(dep) = spec.depends_on.iter().find(|dep| {
            outcomes
                .get(dep.as_str())
                .is_none_or(|o| o.status != StageStatus::Completed)
        }) {
            return self
                .skip_stage(spec, ctx, format!("prerequisite_not_met:{dep}"))
                .await;
        }
        if let Some(stopper) = stopped {
            return self
                .skip_stage(spec, ctx, format!("workflow_stopped:{stopper}"))
                .await;
        }
        if let Some(breaker) = &spec.breaker {
            if self.breakers.acquire(breaker).await == BreakerDecision::Rejected {
                return self.skip_stage(spec, ctx, "breaker_open".to_string()).await;
            }
        }
        match spec.stage.validate(ctx).await {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::NotReady(reason)) => {
                return self.skip_stage(spec, ctx, reason).await;
            }
            Err(e) => {
                // A validation error is a stage failure, not a skip.
                return self.fail_stage(spec, ctx, Utc::now(), 1, e).await;
            }
        }

        let policy = spec.retry.clone().unwrap_or_else(|| self.default_retry.clone());
        let timeout = spec.timeout.or(self.default_timeout);
        let started_at = Utc::now();
        self.observer.stage_started(ctx.job_id(), &spec.name);

        let mut attempt = 0u32;
        let result: Result<Context> = loop {
            attempt += 1;
            match self.attempt(spec, ctx, cancel, timeout).await {
                Ok(next) => break Ok(next),
                Err(e) => {
                    if let Some(log) = ctx.log() {
                        let line = format!(
                            "stage {} attempt {attempt}/{} failed: {e}",
                            spec.name, policy.max_attempts
                        );
                        if let Err(log_err) = log.append(line).await {
                            warn!(stage = %spec.name, error = %log_err, "failed to append job log");
                        }
                    }
                    if matches!(e, PipelineError::Cancelled(_)) {
                        break Err(e);
                    }
                    let fatal_timeout = spec.timeout_is_fatal
                        && matches!(e, PipelineError::StageTimeout { .. });
                    if attempt < policy.max_attempts && policy.is_retryable(&e) && !fatal_timeout {
                        let delay = policy.delay(attempt);
                        debug!(stage = %spec.name, attempt, ?delay, error = %e, "retrying stage");
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    break Err(PipelineError::Cancelled(format!(
                                        "stage {} cancelled during retry backoff",
                                        spec.name
                                    )));
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        continue;
                    }
                    break Err(e);
                }
            }
        };

        match result {
            Ok(next) => {
                if let Some(log) = ctx.log() {
                    let line = format!(
                        "stage {} attempt {attempt}/{} succeeded",
                        spec.name, policy.max_attempts
                    );
                    if let Err(e) = log.append(line).await {
                        warn!(stage = %spec.name, error = %e, "failed to append job log");
                    }
                }
                spec.stage.cleanup(ctx).await;
                let finished_at = Utc::now();
                let produced = produced_outputs(ctx, &next);
                if let Some(breaker) = &spec.breaker {
                    self.breakers.record_success(breaker).await;
                }
                let duration = (finished_at - started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.observer
                    .stage_completed(ctx.job_id(), &spec.name, duration);
                let outcome = StageOutcome {
                    status: StageStatus::Completed,
                    attempts: attempt,
                    started_at,
                    finished_at,
                    error: None,
                    skip_reason: None,
                    outputs: produced,
                };
                self.record_execution(spec, ctx, &outcome).await;
                self.flush_log(ctx).await;
                Ok(outcome)
            }
            Err(e) => self.fail_stage(spec, ctx, started_at, attempt, e).await,
        }
    }

    /// One guarded attempt: the stage body raced against cancellation and
    /// the per-attempt timeout. Dropping the body cancels the attempt and
    /// releases its scoped resources.
    async fn attempt(
        &self,
        spec: &StageSpec,
        ctx: &Context,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Context> {
        let guarded = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(PipelineError::Cancelled(format!(
                    "stage {} cancelled",
                    spec.name
                ))),
                result = spec.stage.execute(ctx) => result,
            }
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StageTimeout {
                    stage: spec.name.clone(),
                    timeout_secs: limit.as_secs(),
                }),
            },
            None => guarded.await,
        }
    }

    async fn skip_stage(
        &self,
        spec: &StageSpec,
        ctx: &Context,
        reason: String,
    ) -> Result<StageOutcome> {
        let now = Utc::now();
        self.observer.stage_skipped(ctx.job_id(), &spec.name, &reason);
        let outcome = StageOutcome {
            status: StageStatus::Skipped,
            attempts: 0,
            started_at: now,
            finished_at: now,
            error: None,
            skip_reason: Some(reason),
            outputs: ValueMap::new(),
        };
        self.record_execution(spec, ctx, &outcome).await;
        Ok(outcome)
    }

    /// Terminal failure handling: cleanup, breaker accounting, exactly one
    /// DLQ item, persistence, then either an outcome or propagated
    /// cancellation.
    async fn fail_stage(
        &self,
        spec: &StageSpec,
        ctx: &Context,
        started_at: chrono::DateTime<Utc>,
        attempts: u32,
        error: PipelineError,
    ) -> Result<StageOutcome> {
        spec.stage.cleanup(ctx).await;
        let cancelled = matches!(error, PipelineError::Cancelled(_));
        if let Some(breaker) = &spec.breaker {
            if !cancelled {
                self.breakers.record_failure(breaker).await;
            }
        }
        self.observer.stage_failed(ctx.job_id(), &spec.name, &error);

        if !cancelled {
            if let Some(stores) = &self.stores {
                let item = NewDlqItem {
                    component: spec.name.clone(),
                    operation: "execute".to_string(),
                    error_type: error.kind().to_string(),
                    error_message: error.to_string(),
                    context: ctx.redacted_snapshot(),
                };
                if let Err(e) = stores.dlq.enqueue(item).await {
                    warn!(stage = %spec.name, error = %e, "failed to enqueue DLQ item");
                }
            }
        }

        let outcome = StageOutcome {
            status: StageStatus::Failed,
            attempts,
            started_at,
            finished_at: Utc::now(),
            error: Some(format!("{}: {error}", error.kind())),
            skip_reason: None,
            outputs: ValueMap::new(),
        };
        self.record_execution(spec, ctx, &outcome).await;
        self.flush_log(ctx).await;

        if cancelled {
            return Err(error);
        }
        Ok(outcome)
    }

    /// Persist the stage execution row when a job context is attached.
    async fn record_execution(&self, spec: &StageSpec, ctx: &Context, outcome: &StageOutcome) {
        let (Some(stores), Some(job_id)) = (&self.stores, ctx.job_id()) else {
            return;
        };
        let mut visible: ValueMap = ctx.inputs().clone();
        visible.extend(ctx.outputs().clone());
        let exec = NewStageExecution {
            job_id,
            stage_name: spec.name.clone(),
            status: outcome.status.as_str().to_string(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            inputs: serde_json::to_value(&visible).ok(),
            outputs: serde_json::to_value(&outcome.outputs).ok(),
            error_message: outcome
                .error
                .clone()
                .or_else(|| outcome.skip_reason.clone()),
            retry_count: outcome.retry_count(),
        };
        if let Err(e) = stores.jobs.record_stage_execution(exec).await {
            warn!(stage = %spec.name, error = %e, "failed to record stage execution");
        }
    }

    /// Mandatory log flush at stage boundaries.
    async fn flush_log(&self, ctx: &Context) {
        if let Some(log) = ctx.log() {
            if let Err(e) = log.flush().await {
                warn!(error = %e, "failed to flush job log");
            }
        }
    }
}

/// Outputs the stage actually produced: keys added or changed relative to
/// the context it was handed.
fn produced_outputs(before: &Context, after: &Context) -> ValueMap {
    after
        .outputs()
        .iter()
        .filter(|(key, value)| before.outputs().get(*key) != Some(*value))
        .map(|(key, value): (&String, &Value)| (key.clone(), value.clone()))
        .collect()
}

fn compute_status(
    policy: WorkflowPolicy,
    outcomes: &BTreeMap<String, StageOutcome>,
) -> WorkflowStatus {
    if outcomes
        .values()
        .all(|o| o.status == StageStatus::Completed)
    {
        WorkflowStatus::Completed
    } else if policy == WorkflowPolicy::Continue {
        WorkflowStatus::PartiallyCompleted
    } else {
        WorkflowStatus::Failed
    }
}
