//! Helper-command adapters for the collaborator interfaces.
//!
//! A deployment points the daemon at one executable per scientific step.
//! Each collaborator call writes a typed JSON request to a scratch file,
//! invokes the command with the operation name as its sole argument and
//! `FRINGE_REQUEST_PATH`/`FRINGE_RESPONSE_PATH` in the environment, and
//! reads the JSON response record back. Stdout and stderr are surfaced as
//! trace events; results travel only through the response record. With
//! these adapters the built-in stages — including the apply stage's
//! `active_applylist` lookup — run unchanged over external science code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::cal::{CalKind, CaltableRef};
use crate::config::HelperConfig;
use crate::error::{PipelineError, Result};
use crate::stage::ValueMap;

use super::collab::{CalApplier, CalSolver, Converter, ImageArtifact, Imager, SolvedTable};
use super::ScienceDeps;

/// Runs one helper executable with the request/response file protocol.
#[derive(Clone, Debug)]
pub struct HelperCommand {
    program: PathBuf,
}

impl HelperCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn invoke<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let exchange = tempfile::tempdir()?;
        let request_path = exchange.path().join("request.json");
        let response_path = exchange.path().join("response.json");
        tokio::fs::write(&request_path, serde_json::to_vec_pretty(request)?).await?;

        let mut child = Command::new(&self.program)
            .arg(operation)
            .env("FRINGE_REQUEST_PATH", &request_path)
            .env("FRINGE_RESPONSE_PATH", &response_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::Fatal(format!(
                    "failed to spawn helper {} for {operation}: {e}",
                    self.program.display()
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = stderr.map(|stderr| {
            let operation = operation.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(helper = %operation, line, "helper stderr");
                }
            })
        });

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(helper = operation, line, "helper output");
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(match status.code() {
                Some(code) => PipelineError::Fatal(format!(
                    "helper {operation} exited with status {code}"
                )),
                // Killed by a signal; likely an external intervention
                // worth retrying.
                None => PipelineError::Transient(format!(
                    "helper {operation} terminated by signal"
                )),
            });
        }

        let raw = tokio::fs::read(&response_path).await.map_err(|_| {
            PipelineError::Fatal(format!("helper {operation} produced no response record"))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[derive(Serialize)]
struct ConvertRequest<'a> {
    input_dir: &'a Path,
    output_dir: &'a Path,
    start_mjd: f64,
    end_mjd: f64,
    writer: &'a str,
    workers: usize,
}

#[derive(Deserialize)]
struct ConvertResponse {
    ms_path: PathBuf,
}

#[derive(Serialize)]
struct SolveRequest<'a> {
    ms_path: &'a Path,
    kind: CalKind,
    params: &'a ValueMap,
}

#[derive(Deserialize)]
struct SolveResponse {
    path: PathBuf,
    #[serde(default)]
    apply_order: i32,
}

#[derive(Serialize)]
struct ApplyRequest<'a> {
    ms_path: &'a Path,
    tables: &'a [CaltableRef],
}

#[derive(Deserialize)]
struct ApplyResponse {
    ms_path: PathBuf,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    ms_path: &'a Path,
    params: &'a ValueMap,
}

#[derive(Deserialize)]
struct ImageResponse {
    path: PathBuf,
    beam: f64,
    noise: f64,
    #[serde(default)]
    pbcor: bool,
}

/// Conversion over a helper command.
#[derive(Clone, Debug)]
pub struct HelperConverter {
    command: HelperCommand,
}

impl HelperConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            command: HelperCommand::new(program),
        }
    }
}

#[async_trait]
impl Converter for HelperConverter {
    async fn convert(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        start_mjd: f64,
        end_mjd: f64,
        writer: &str,
        workers: usize,
    ) -> Result<PathBuf> {
        let response: ConvertResponse = self
            .command
            .invoke(
                "convert",
                &ConvertRequest {
                    input_dir,
                    output_dir,
                    start_mjd,
                    end_mjd,
                    writer,
                    workers,
                },
            )
            .await?;
        Ok(response.ms_path)
    }
}

/// Calibration solving over a helper command.
#[derive(Clone, Debug)]
pub struct HelperCalSolver {
    command: HelperCommand,
}

impl HelperCalSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            command: HelperCommand::new(program),
        }
    }
}

#[async_trait]
impl CalSolver for HelperCalSolver {
    async fn solve(
        &self,
        ms_path: &Path,
        kind: CalKind,
        params: &ValueMap,
    ) -> Result<SolvedTable> {
        let response: SolveResponse = self
            .command
            .invoke(
                "solve",
                &SolveRequest {
                    ms_path,
                    kind,
                    params,
                },
            )
            .await?;
        Ok(SolvedTable {
            path: response.path,
            apply_order: response.apply_order,
        })
    }
}

/// Calibration application over a helper command. The apply-list resolved
/// from the registry rides along in the request, so the helper applies
/// exactly the tables the control plane selected.
#[derive(Clone, Debug)]
pub struct HelperCalApplier {
    command: HelperCommand,
}

impl HelperCalApplier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            command: HelperCommand::new(program),
        }
    }
}

#[async_trait]
impl CalApplier for HelperCalApplier {
    async fn apply(&self, ms_path: &Path, tables: &[CaltableRef]) -> Result<PathBuf> {
        let response: ApplyResponse = self
            .command
            .invoke("apply", &ApplyRequest { ms_path, tables })
            .await?;
        Ok(response.ms_path)
    }
}

/// Imaging over a helper command.
#[derive(Clone, Debug)]
pub struct HelperImager {
    command: HelperCommand,
}

impl HelperImager {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            command: HelperCommand::new(program),
        }
    }
}

#[async_trait]
impl Imager for HelperImager {
    async fn image(&self, ms_path: &Path, params: &ValueMap) -> Result<ImageArtifact> {
        let response: ImageResponse = self
            .command
            .invoke("image", &ImageRequest { ms_path, params })
            .await?;
        Ok(ImageArtifact {
            path: response.path,
            beam: response.beam,
            noise: response.noise,
            pbcor: response.pbcor,
        })
    }
}

impl ScienceDeps {
    /// Adapter bundle over the configured helper commands; `None` until
    /// every command is configured.
    pub fn from_helpers(helpers: &HelperConfig) -> Option<Self> {
        Some(Self {
            converter: Arc::new(HelperConverter::new(helpers.convert_cmd.clone()?)),
            solver: Arc::new(HelperCalSolver::new(helpers.solve_cmd.clone()?)),
            applier: Arc::new(HelperCalApplier::new(helpers.apply_cmd.clone()?)),
            imager: Arc::new(HelperImager::new(helpers.image_cmd.clone()?)),
        })
    }
}
