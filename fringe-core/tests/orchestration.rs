//! Orchestrator and job-runner behaviour against real stores.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fringe_core::config::{PipelineConfig, WorkflowPolicy};
use fringe_core::error::PipelineError;
use fringe_core::runner::{JobRunner, WorkflowRegistry};
use fringe_core::stage::{Context, ContextData, Value};
use fringe_core::store::{DlqFilter, DlqStatus, JobStatus, StoreSet};
use fringe_core::workflow::{
    BreakerBoard, BreakerSettings, Orchestrator, RetryPolicy, StageSpec, StageStatus, Workflow,
    WorkflowStatus,
};

use support::{open_stores, FailMode, ScriptedStage};

fn config() -> Arc<PipelineConfig> {
    Arc::new(PipelineConfig::default())
}

fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(max_attempts, Duration::ZERO, Duration::ZERO)
}

fn runner_for(workflow: Workflow, stores: &StoreSet) -> JobRunner {
    let mut registry = WorkflowRegistry::new();
    registry.register(workflow);
    let orchestrator = Arc::new(Orchestrator::new().with_stores(stores.clone()));
    JobRunner::new(config(), stores.clone(), Arc::new(registry), orchestrator)
}

#[tokio::test]
async fn happy_path_three_stage_workflow() {
    let (stores, _dir) = open_stores().await;
    let workflow = Workflow::new("s1")
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("a"))))
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("b"))).after(["a"]))
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("c"))).after(["b"]));
    let runner = runner_for(workflow, &stores);

    let job = runner
        .submit_and_execute("s1", Default::default(), &CancellationToken::new())
        .await
        .expect("job should complete");

    assert_eq!(job.status, JobStatus::Done);
    assert!(job.error_message.is_none());

    // The final context carries the last writer of `art`.
    let outputs = job.outputs.expect("outputs recorded");
    assert_eq!(outputs["art"]["value"], "c.out");

    // Per-stage results record what each stage produced.
    let stage_results = job.stage_results.expect("stage results recorded");
    assert_eq!(stage_results["a"]["outputs"]["art"]["value"], "a.out");
    assert_eq!(stage_results["c"]["outputs"]["art"]["value"], "c.out");
    assert_eq!(stage_results["b"]["status"], "completed");

    let rows = stores
        .jobs
        .list_stage_executions(job.job_id)
        .await
        .expect("stage executions");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == "completed"));
    for row in &rows {
        assert!(row.finished_at >= row.started_at);
        let expected =
            (row.finished_at - row.started_at).num_milliseconds() as f64 / 1_000.0;
        assert!((row.duration_seconds - expected).abs() < 1e-9);
    }
}

#[tokio::test]
async fn transient_failure_recovers_within_retry_budget() {
    let (stores, _dir) = open_stores().await;
    let stage = ScriptedStage::new("a")
        .failing(FailMode::TransientTimes(2))
        .with_output("done", true);
    let executions = stage.execution_counter();
    let workflow = Workflow::new("s2")
        .stage(StageSpec::new(Arc::new(stage)).retry(instant_retry(3)));
    let runner = runner_for(workflow, &stores);

    let job = runner
        .submit_and_execute("s2", Default::default(), &CancellationToken::new())
        .await
        .expect("job should recover");

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(executions.load(Ordering::SeqCst), 3);

    let rows = stores.jobs.list_stage_executions(job.job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "completed");
    assert_eq!(rows[0].retry_count, 2);

    // One log entry per attempt: two failures and the final success.
    let log = stores.jobs.list_job_log(job.job_id).await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log[0].line.contains("attempt 1/3 failed"));
    assert!(log[2].line.contains("attempt 3/3 succeeded"));

    // Recovery means no dead letters.
    let dlq = stores.dlq.list(DlqFilter::default()).await.unwrap();
    assert!(dlq.is_empty());
}

#[tokio::test]
async fn terminal_failure_lands_exactly_one_dlq_item() {
    let (stores, _dir) = open_stores().await;
    let workflow = Workflow::new("s3").stage(
        StageSpec::new(Arc::new(
            ScriptedStage::new("a").failing(FailMode::AlwaysFatal),
        ))
        .retry(instant_retry(3)),
    );
    let runner = runner_for(workflow, &stores);

    let job = runner
        .submit_and_execute("s3", Default::default(), &CancellationToken::new())
        .await
        .expect("job finishes with a failed status");

    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.expect("failure recorded");
    assert!(message.contains("stage a failed"), "got: {message}");

    let dlq = stores.dlq.list(DlqFilter::default()).await.unwrap();
    assert_eq!(dlq.len(), 1);
    let item = &dlq[0];
    assert_eq!(item.component, "a");
    assert_eq!(item.operation, "execute");
    assert_eq!(item.status, DlqStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.error_type, "fatal");

    // The captured context snapshot round-trips.
    let data: ContextData = serde_json::from_value(item.context.clone()).expect("parseable");
    assert_eq!(serde_json::to_value(&data).unwrap(), item.context);
    assert_eq!(data.job_id, Some(job.job_id));
}

#[tokio::test]
async fn dependency_failure_skips_downstream_stage() {
    let workflow = Workflow::new("s4")
        .stage(
            StageSpec::new(Arc::new(
                ScriptedStage::new("a").failing(FailMode::AlwaysFatal),
            ))
            .retry(RetryPolicy::none()),
        )
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("b"))).after(["a"]));

    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .expect("run finishes");

    assert_eq!(run.status, WorkflowStatus::Failed);
    assert_eq!(run.stages["a"].status, StageStatus::Failed);
    let b = &run.stages["b"];
    assert_eq!(b.status, StageStatus::Skipped);
    assert_eq!(b.skip_reason.as_deref(), Some("prerequisite_not_met:a"));
    assert_eq!(b.attempts, 0);
}

#[tokio::test]
async fn empty_workflow_completes_immediately() {
    let run = Orchestrator::new()
        .run(
            &Workflow::new("empty"),
            Context::new(config()),
            &CancellationToken::new(),
        )
        .await
        .expect("empty workflow runs");
    assert_eq!(run.status, WorkflowStatus::Completed);
    assert!(run.stages.is_empty());
}

#[tokio::test]
async fn self_dependency_is_rejected_statically() {
    let workflow = Workflow::new("loop").stage(
        StageSpec::new(Arc::new(ScriptedStage::new("a"))).after(["a"]),
    );
    let err = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::WorkflowInvalid(_)));
}

#[tokio::test]
async fn completed_dependencies_finish_before_dependents_start() {
    let workflow = Workflow::new("chain")
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("a"))))
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("b"))).after(["a"]))
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("c"))).after(["b"]));
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Completed);
    assert!(run.stages["b"].started_at >= run.stages["a"].finished_at);
    assert!(run.stages["c"].started_at >= run.stages["b"].finished_at);
}

#[tokio::test]
async fn open_breaker_skips_guarded_stage() {
    let breakers = Arc::new(
        BreakerBoard::new(BreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
        }),
    );
    let orchestrator = Orchestrator::new()
        .with_breakers(breakers)
        .with_default_retry(RetryPolicy::none());

    let failing = Workflow::new("first").stage(
        StageSpec::new(Arc::new(
            ScriptedStage::new("solve").failing(FailMode::AlwaysFatal),
        ))
        .breaker("solver"),
    );
    let run = orchestrator
        .run(&failing, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.stages["solve"].status, StageStatus::Failed);

    // Same breaker, new workflow: the stage is skipped while the breaker
    // cools down.
    let guarded = Workflow::new("second").stage(
        StageSpec::new(Arc::new(ScriptedStage::new("solve"))).breaker("solver"),
    );
    let run = orchestrator
        .run(&guarded, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.stages["solve"].status, StageStatus::Skipped);
    assert_eq!(run.stages["solve"].skip_reason.as_deref(), Some("breaker_open"));
}

#[tokio::test]
async fn continue_policy_runs_independent_stages_past_a_failure() {
    let workflow = Workflow::new("partial")
        .policy(WorkflowPolicy::Continue)
        .stage(
            StageSpec::new(Arc::new(
                ScriptedStage::new("a").failing(FailMode::AlwaysFatal),
            ))
            .retry(RetryPolicy::none()),
        )
        .stage(StageSpec::new(Arc::new(ScriptedStage::emitting_art("b"))));
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::PartiallyCompleted);
    assert_eq!(run.stages["a"].status, StageStatus::Failed);
    assert_eq!(run.stages["b"].status, StageStatus::Completed);
}

#[tokio::test]
async fn stop_policy_skips_the_rest_after_a_failure() {
    let workflow = Workflow::new("stop")
        .stage(
            StageSpec::new(Arc::new(
                ScriptedStage::new("a").failing(FailMode::AlwaysFatal),
            ))
            .retry(RetryPolicy::none()),
        )
        .stage(StageSpec::new(Arc::new(ScriptedStage::new("b"))));
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Failed);
    assert_eq!(run.stages["b"].status, StageStatus::Skipped);
    assert_eq!(
        run.stages["b"].skip_reason.as_deref(),
        Some("workflow_stopped:a")
    );
}

#[tokio::test]
async fn failed_validation_skips_with_reason() {
    let stage = ScriptedStage::new("apply").not_ready("no active calibration");
    let executions = stage.execution_counter();
    let workflow = Workflow::new("v").stage(StageSpec::new(Arc::new(stage)));
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.stages["apply"].status, StageStatus::Skipped);
    assert_eq!(
        run.stages["apply"].skip_reason.as_deref(),
        Some("no active calibration")
    );
    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn attempt_timeout_is_terminal_when_retries_are_exhausted() {
    let stage = ScriptedStage::new("slow").with_delay(Duration::from_millis(500));
    let executions = stage.execution_counter();
    let workflow = Workflow::new("t").stage(
        StageSpec::new(Arc::new(stage))
            .retry(RetryPolicy::none())
            .timeout(Duration::from_millis(20)),
    );
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    let outcome = &run.stages["slow"];
    assert_eq!(outcome.status, StageStatus::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("stage_timeout"));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fatal_timeout_suppresses_retries() {
    let stage = ScriptedStage::new("slow").with_delay(Duration::from_millis(500));
    let executions = stage.execution_counter();
    let workflow = Workflow::new("tf").stage(
        StageSpec::new(Arc::new(stage))
            .retry(instant_retry(3))
            .timeout(Duration::from_millis(20))
            .fatal_timeout(),
    );
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.stages["slow"].status, StageStatus::Failed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_propagates_and_cleanup_still_runs() {
    let stage = ScriptedStage::new("long").with_delay(Duration::from_secs(30));
    let cleanups = stage.cleanup_counter();
    let workflow = Workflow::new("c").stage(StageSpec::new(Arc::new(stage)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = Orchestrator::new()
        .run(&workflow, Context::new(config()), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(_)));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_workflow_still_honours_dependency_edges() {
    let workflow = Workflow::new("par")
        .parallel(true)
        .stage(StageSpec::new(Arc::new(
            ScriptedStage::emitting_art("a").with_delay(Duration::from_millis(50)),
        )))
        .stage(StageSpec::new(Arc::new(
            ScriptedStage::emitting_art("b").with_delay(Duration::from_millis(50)),
        )))
        .stage(
            StageSpec::new(Arc::new(ScriptedStage::emitting_art("c"))).after(["a", "b"]),
        );
    let run = Orchestrator::new()
        .run(&workflow, Context::new(config()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Completed);
    assert!(run.stages["c"].started_at >= run.stages["a"].finished_at);
    assert!(run.stages["c"].started_at >= run.stages["b"].finished_at);
    assert_eq!(
        run.context.value("art"),
        Some(&Value::from("c.out"))
    );
}
