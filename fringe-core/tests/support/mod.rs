#![allow(dead_code)]
//! Shared fixtures for the integration suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use fringe_core::error::{PipelineError, Result};
use fringe_core::stage::{Context, Readiness, Stage, Value, ValueMap};
use fringe_core::store::StoreSet;

/// Open a fresh store set in a temp directory. Keep the guard alive for
/// the duration of the test.
pub async fn open_stores() -> (StoreSet, TempDir) {
    let dir = tempfile::tempdir().expect("create temp state dir");
    let stores = StoreSet::open(dir.path()).await.expect("open stores");
    (stores, dir)
}

/// How a scripted stage should fail.
#[derive(Clone, Copy, Debug)]
pub enum FailMode {
    Never,
    /// Fail the first `n` attempts with a transient error, then succeed.
    TransientTimes(u32),
    /// Every attempt fails fatally.
    AlwaysFatal,
}

/// Configurable stage double used across the suites.
pub struct ScriptedStage {
    name: String,
    fail: FailMode,
    outputs: ValueMap,
    not_ready: Option<String>,
    delay: Option<Duration>,
    executions: Arc<AtomicU32>,
    cleanups: Arc<AtomicU32>,
}

impl ScriptedStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: FailMode::Never,
            outputs: ValueMap::new(),
            not_ready: None,
            delay: None,
            executions: Arc::new(AtomicU32::new(0)),
            cleanups: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Stage returning `{"art": "<NAME>.out"}` like the spec scenarios.
    pub fn emitting_art(name: &str) -> Self {
        let mut stage = Self::new(name);
        stage
            .outputs
            .insert("art".into(), Value::from(format!("{name}.out")));
        stage
    }

    pub fn with_output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn failing(mut self, mode: FailMode) -> Self {
        self.fail = mode;
        self
    }

    pub fn not_ready(mut self, reason: &str) -> Self {
        self.not_ready = Some(reason.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn execution_counter(&self) -> Arc<AtomicU32> {
        self.executions.clone()
    }

    pub fn cleanup_counter(&self) -> Arc<AtomicU32> {
        self.cleanups.clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &Context) -> Result<Readiness> {
        match &self.not_ready {
            Some(reason) => Ok(Readiness::NotReady(reason.clone())),
            None => Ok(Readiness::Ready),
        }
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let attempt = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.fail {
            FailMode::Never => {}
            FailMode::TransientTimes(n) if attempt <= n => {
                return Err(PipelineError::StoreUnavailable(format!(
                    "{} attempt {attempt} flaked",
                    self.name
                )));
            }
            FailMode::TransientTimes(_) => {}
            FailMode::AlwaysFatal => {
                return Err(PipelineError::Fatal(format!("{} exploded", self.name)));
            }
        }
        Ok(ctx.with_outputs(self.outputs.clone()))
    }

    async fn cleanup(&self, _ctx: &Context) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
