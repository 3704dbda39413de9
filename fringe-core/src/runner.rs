//! Job runner: API-initiated workflow dispatch, job bookkeeping, and the
//! streaming group-processing loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cal::datetime_to_mjd;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::resources::ResourceManager;
use crate::stage::{Context, TracingStageObserver, Value, ValueMap};
use crate::store::{
    GroupClaim, GroupState, JobLogWriter, JobPatch, JobRecord, JobStatus, QueueStore, StoreSet,
};
use crate::workflow::{Orchestrator, StageStatus, Workflow, WorkflowRun, WorkflowStatus};

/// Named workflows available for dispatch.
#[derive(Clone, Debug, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: Workflow) {
        self.workflows
            .insert(workflow.name.clone(), Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Per-stage summary persisted into the job row's `stage_results`.
#[derive(Debug, Serialize)]
struct StageResultSummary<'a> {
    status: &'a str,
    attempts: u32,
    retry_count: u32,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_reason: Option<&'a str>,
    outputs: &'a ValueMap,
}

/// Accepts workflow-invocation requests and drives them to completion.
#[derive(Clone, Debug)]
pub struct JobRunner {
    config: Arc<PipelineConfig>,
    stores: StoreSet,
    registry: Arc<WorkflowRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl JobRunner {
    pub fn new(
        config: Arc<PipelineConfig>,
        stores: StoreSet,
        registry: Arc<WorkflowRegistry>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config,
            stores,
            registry,
            orchestrator,
        }
    }

    /// Allocate a job for a named workflow. The job starts `pending`;
    /// [`JobRunner::execute`] picks it up.
    pub async fn submit(&self, workflow_name: &str, inputs: ValueMap) -> Result<i64> {
        if self.registry.get(workflow_name).is_none() {
            return Err(PipelineError::NotFound(format!(
                "workflow {workflow_name}"
            )));
        }
        let inputs_json = serde_json::to_value(&inputs)?;
        let job_id = self
            .stores
            .jobs
            .create_job(workflow_name, &inputs_json)
            .await?;
        info!(job_id, workflow = workflow_name, "job submitted");
        Ok(job_id)
    }

    /// Execute a previously submitted job.
    ///
    /// Orchestrator callbacks land in the stage-execution table while the
    /// run progresses; the terminal status, outputs, and error taxonomy
    /// are written back to the job row at the end. Cancellation is
    /// propagated to the caller after being recorded.
    pub async fn execute(&self, job_id: i64, cancel: &CancellationToken) -> Result<JobRecord> {
        let job = self.stores.jobs.get_job(job_id).await?;
        let workflow = self.registry.get(&job.workflow_name).ok_or_else(|| {
            PipelineError::NotFound(format!("workflow {}", job.workflow_name))
        })?;

        self.stores
            .jobs
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    started_at: Some(Utc::now()),
                    ..JobPatch::default()
                },
            )
            .await?;

        let inputs: ValueMap = serde_json::from_value(job.inputs.clone())?;
        let resources = Arc::new(ResourceManager::for_job(
            self.config.paths.scratch_dir.clone(),
            format!("job-{job_id}"),
        ));
        let log = Arc::new(JobLogWriter::new(
            self.stores.jobs.clone(),
            job_id,
            &self.config.logging,
        ));
        let ctx = Context::new(self.config.clone())
            .with_job_id(job_id)
            .with_inputs(inputs)
            .with_stores(self.stores.clone())
            .with_resources(resources.clone())
            .with_observer(Arc::new(TracingStageObserver))
            .with_log(log.clone());

        let result = self.orchestrator.run(&workflow, ctx, cancel).await;
        resources.release_all();

        let record = match result {
            Ok(run) => {
                self.finish_job(job_id, &run).await?;
                if let Err(e) = log.flush().await {
                    warn!(job_id, error = %e, "failed to flush job log");
                }
                self.stores.jobs.get_job(job_id).await?
            }
            Err(e) => {
                self.stores
                    .jobs
                    .update_job(
                        job_id,
                        JobPatch {
                            status: Some(JobStatus::Failed),
                            finished_at: Some(Utc::now()),
                            error_message: Some(format!("{}: {e}", e.kind())),
                            ..JobPatch::default()
                        },
                    )
                    .await?;
                if let Err(flush_err) = log.flush().await {
                    warn!(job_id, error = %flush_err, "failed to flush job log");
                }
                return Err(e);
            }
        };
        Ok(record)
    }

    /// Submit and run in one step.
    pub async fn submit_and_execute(
        &self,
        workflow_name: &str,
        inputs: ValueMap,
        cancel: &CancellationToken,
    ) -> Result<JobRecord> {
        let job_id = self.submit(workflow_name, inputs).await?;
        self.execute(job_id, cancel).await
    }

    async fn finish_job(&self, job_id: i64, run: &WorkflowRun) -> Result<()> {
        let summaries: HashMap<&str, StageResultSummary<'_>> = run
            .stages
            .iter()
            .map(|(name, outcome)| {
                (
                    name.as_str(),
                    StageResultSummary {
                        status: outcome.status.as_str(),
                        attempts: outcome.attempts,
                        retry_count: outcome.retry_count(),
                        started_at: outcome.started_at,
                        finished_at: outcome.finished_at,
                        error: outcome.error.as_deref(),
                        skip_reason: outcome.skip_reason.as_deref(),
                        outputs: &outcome.outputs,
                    },
                )
            })
            .collect();

        let (status, error_message) = match run.status {
            WorkflowStatus::Completed => (JobStatus::Done, None),
            WorkflowStatus::PartiallyCompleted => (
                JobStatus::Done,
                Some("partially completed: some stages failed or were skipped".to_string()),
            ),
            WorkflowStatus::Failed => {
                let detail = run
                    .stages
                    .iter()
                    .find(|(_, o)| o.status == StageStatus::Failed)
                    .and_then(|(name, o)| {
                        o.error.as_ref().map(|e| format!("stage {name} failed: {e}"))
                    })
                    .unwrap_or_else(|| "workflow failed".to_string());
                (JobStatus::Failed, Some(detail))
            }
        };

        self.stores
            .jobs
            .update_job(
                job_id,
                JobPatch {
                    status: Some(status),
                    outputs: Some(serde_json::to_value(run.context.outputs())?),
                    stage_results: Some(serde_json::to_value(&summaries)?),
                    finished_at: Some(Utc::now()),
                    error_message,
                    ..JobPatch::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Streaming loop: claims pending groups and runs the configured workflow
/// over each.
#[derive(Clone, Debug)]
pub struct GroupProcessor {
    runner: JobRunner,
    queue: QueueStore,
    workflow_name: String,
    heartbeat_interval: Duration,
    claim_poll_interval: Duration,
}

impl GroupProcessor {
    pub fn new(runner: JobRunner, queue: QueueStore, workflow_name: impl Into<String>) -> Self {
        let inprogress = runner.config.ingest.group_inprogress_timeout_sec;
        Self {
            runner,
            queue,
            workflow_name: workflow_name.into(),
            heartbeat_interval: Duration::from_secs((inprogress / 3).max(1)),
            claim_poll_interval: Duration::from_secs(5),
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!("group processor stopping");
                return;
            }
            match self.queue.claim_next_pending().await {
                Ok(Some(claim)) => {
                    let group_id = claim.group.group_id.clone();
                    if let Err(e) = self.process_group(claim, &cancel).await {
                        warn!(group_id, error = %e, "group processing failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.claim_poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to claim pending group");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.claim_poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Drive one claimed group through the workflow, heartbeating while
    /// the job runs.
    pub async fn process_group(&self, claim: GroupClaim, cancel: &CancellationToken) -> Result<()> {
        let group_id = claim.group.group_id.clone();
        info!(
            group_id,
            attempt = claim.group.attempt_count,
            files = claim.files.len(),
            "processing group"
        );

        let heartbeat = {
            let queue = self.queue.clone();
            let group_id = group_id.clone();
            let interval = self.heartbeat_interval;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if queue.heartbeat(&group_id).await.is_err() {
                        return;
                    }
                }
            })
        };

        let result = self
            .runner
            .submit_and_execute(&self.workflow_name, group_inputs(&claim), cancel)
            .await;
        heartbeat.abort();

        match result {
            Ok(job) if job.status == JobStatus::Done => {
                self.queue.mark_group(&group_id, GroupState::Completed).await
            }
            Ok(_) => self.queue.mark_group(&group_id, GroupState::Failed).await,
            Err(PipelineError::Cancelled(reason)) => {
                // Shutdown mid-run: hand the group back to the queue.
                self.queue.mark_group(&group_id, GroupState::Pending).await?;
                Err(PipelineError::Cancelled(reason))
            }
            Err(e) => {
                self.queue.mark_group(&group_id, GroupState::Failed).await?;
                Err(e)
            }
        }
    }
}

/// Context inputs derived from a claimed group.
fn group_inputs(claim: &GroupClaim) -> ValueMap {
    let mut inputs = ValueMap::new();
    inputs.insert("group_id".into(), Value::from(claim.group.group_id.as_str()));
    inputs.insert("attempt".into(), Value::from(claim.group.attempt_count));
    inputs.insert(
        "files".into(),
        Value::List(
            claim
                .files
                .iter()
                .map(|f| {
                    let mut entry = ValueMap::new();
                    entry.insert("subband".into(), Value::from(f.subband_index));
                    entry.insert("path".into(), Value::from(f.path.as_str()));
                    Value::Map(entry)
                })
                .collect(),
        ),
    );
    // Groups are keyed by the shared timestamp of their files; when the
    // key parses as a UTC timestamp the observation epoch rides along so
    // the conversion stage can window its output.
    if let Ok(epoch) =
        chrono::NaiveDateTime::parse_from_str(&claim.group.group_id, "%Y-%m-%dT%H:%M:%S")
    {
        let mjd = datetime_to_mjd(epoch.and_utc());
        inputs.insert("start_mjd".into(), Value::from(mjd));
        inputs.insert("end_mjd".into(), Value::from(mjd));
    }
    inputs
}
