//! Isolated stage execution: a spawned external helper with structured
//! output capture.
//!
//! The helper receives the context data as a JSON file (path in
//! `FRINGE_INPUTS_PATH`) and must write its produced outputs as a JSON
//! object of tagged values to `FRINGE_OUTPUTS_PATH`. Stdout and stderr are
//! streamed line by line into the batched job log and the observer's
//! progress hook; outputs travel only through the structured record, never
//! by scraping log lines.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};

use super::context::{Context, ValueMap};
use super::{ExecutionMode, Stage};

/// A stage whose body is an external helper command.
#[derive(Clone, Debug)]
pub struct IsolatedCommandStage {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl IsolatedCommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    async fn forward_line(&self, ctx: &Context, line: &str) {
        ctx.observer().stage_progress(ctx.job_id(), &self.name, line);
        if let Some(log) = ctx.log() {
            if let Err(e) = log.append(format!("[{}] {line}", self.name)).await {
                debug!(stage = %self.name, error = %e, "dropping helper log line");
            }
        }
    }
}

#[async_trait]
impl Stage for IsolatedCommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Isolated
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        // Exchange directory for the inputs/outputs records. Removed when
        // the guard drops, on every exit path.
        let fallback;
        let scoped;
        let exchange = match ctx.resources() {
            Some(resources) => {
                scoped = resources.temp_dir(&self.name)?;
                scoped.path().to_path_buf()
            }
            None => {
                fallback = tempfile::tempdir()?;
                fallback.path().to_path_buf()
            }
        };
        let inputs_path = exchange.join("inputs.json");
        let outputs_path = exchange.join("outputs.json");
        tokio::fs::write(&inputs_path, serde_json::to_vec_pretty(ctx.data())?).await?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("FRINGE_INPUTS_PATH", &inputs_path)
            .env("FRINGE_OUTPUTS_PATH", &outputs_path)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            PipelineError::Fatal(format!(
                "failed to spawn helper {} for stage {}: {e}",
                self.program.display(),
                self.name
            ))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = stderr.map(|stderr| {
            let stage = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stage.forward_line(&ctx, &line).await;
                }
            })
        });

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                self.forward_line(ctx, &line).await;
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(match status.code() {
                Some(code) => PipelineError::Fatal(format!(
                    "helper for stage {} exited with status {code}",
                    self.name
                )),
                // Killed by a signal; likely an external intervention
                // worth retrying.
                None => PipelineError::Transient(format!(
                    "helper for stage {} terminated by signal",
                    self.name
                )),
            });
        }

        let raw = tokio::fs::read(&outputs_path).await.map_err(|_| {
            PipelineError::Fatal(format!(
                "helper for stage {} produced no outputs record",
                self.name
            ))
        })?;
        let outputs: ValueMap = serde_json::from_slice(&raw)?;
        Ok(ctx.with_outputs(outputs))
    }
}
