//! Typed configuration tree for the pipeline control plane.
//!
//! All fields carry defaults so deployments can progressively adopt new
//! knobs without supplying a full configuration payload. The tree is passed
//! through the stage [`Context`](crate::stage::Context) as a read-only
//! handle; loading and validation live in `fringe-config`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root of the configuration tree.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Filesystem layout: input, output, scratch, and state directories.
    pub paths: PathsConfig,
    /// Ingest watcher and group assembly tuning.
    pub ingest: IngestConfig,
    /// Stage orchestration defaults: retry policy and workflow policy.
    pub orchestrator: OrchestratorConfig,
    /// Worker pool sizing and stage timeout defaults.
    pub resources: ResourceConfig,
    /// Batched job-log commit tuning.
    pub logging: LoggingConfig,
    /// Optional external helper commands used by the daemon's isolated
    /// stages. Empty entries disable the processing loop.
    pub helpers: HelperConfig,
}

/// Directory layout used by the daemon and the built-in stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Flat directory watched for incoming sub-band files.
    pub input_dir: PathBuf,
    /// Root for produced artifacts; stages place files under the science,
    /// calibrator, and failed subtrees.
    pub output_dir: PathBuf,
    /// Root for scoped temp and scratch directories.
    pub scratch_dir: PathBuf,
    /// Location of the durable store files.
    pub state_dir: PathBuf,
    /// Subtree names under `output_dir`.
    pub science_subdir: String,
    pub calibrator_subdir: String,
    pub failed_subdir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("incoming"),
            output_dir: PathBuf::from("products"),
            scratch_dir: PathBuf::from("scratch"),
            state_dir: PathBuf::from("state"),
            science_subdir: "science".to_string(),
            calibrator_subdir: "calibrators".to_string(),
            failed_subdir: "failed".to_string(),
        }
    }
}

/// Ingest watcher and group state machine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Regular expression mapping a filename to its group and sub-band.
    /// Must define named captures `group` and `subband` (integer).
    pub filename_regex: String,
    /// Number of sub-band files composing a complete group.
    pub expected_subbands: u32,
    /// A group still collecting after this long with no new arrivals is
    /// marked failed.
    pub group_completion_timeout_sec: u64,
    /// An in-progress group without a heartbeat for this long is returned
    /// to the pending queue (attempt count bumped).
    pub group_inprogress_timeout_sec: u64,
    /// Re-queue budget before a stalled group is marked failed.
    pub max_group_attempts: u32,
    /// Debounce window for coalescing rapid watcher notification bursts.
    pub debounce_window_ms: u64,
    /// Cadence of the full-directory rescan that backstops the watcher.
    pub rescan_interval_ms: u64,
    /// Cadence of the housekeeper sweep driving timeout transitions.
    pub housekeeper_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            filename_regex: r"^(?P<group>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})_sb(?P<subband>\d+)\.hdf5$".to_string(),
            expected_subbands: 16,
            group_completion_timeout_sec: 3_600,
            group_inprogress_timeout_sec: 1_800,
            max_group_attempts: 3,
            debounce_window_ms: 250,
            rescan_interval_ms: 30_000,
            housekeeper_interval_ms: 15_000,
        }
    }
}

impl IngestConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms.max(1))
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.max(1))
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms.max(1))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.group_completion_timeout_sec)
    }

    pub fn inprogress_timeout(&self) -> Duration {
        Duration::from_secs(self.group_inprogress_timeout_sec)
    }
}

/// Backoff strategy names accepted by the configuration surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Fixed,
    Immediate,
    /// No retries at all; the first attempt is terminal.
    None,
}

/// Declarative retry policy shared by all stages unless overridden.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub initial_delay_sec: f64,
    pub max_delay_sec: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            initial_delay_sec: 2.0,
            max_delay_sec: 300.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_delay_sec.max(0.0))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_sec.max(0.0))
    }
}

/// Failure policy applied when a stage exhausts its retries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPolicy {
    #[default]
    StopOnFirstFailure,
    Continue,
}

/// Orchestrator defaults applied to workflows that do not override them.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_retry: RetryConfig,
    pub workflow_policy: WorkflowPolicy,
    /// Allow dependency-free stages to run concurrently. Default is the
    /// deterministic sequential order.
    pub parallel_stages: bool,
}

/// Worker pool sizing and per-stage timeout defaults.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Upper bound on concurrently executing stages when a workflow opts
    /// into parallelism.
    pub max_worker_stages: usize,
    /// Default per-attempt timeout. Zero disables the timeout.
    pub stage_default_timeout_sec: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_worker_stages: 4,
            stage_default_timeout_sec: 3_600,
        }
    }
}

impl ResourceConfig {
    /// Stage timeout as a `Duration`; `None` when disabled.
    pub fn stage_default_timeout(&self) -> Option<Duration> {
        (self.stage_default_timeout_sec > 0)
            .then(|| Duration::from_secs(self.stage_default_timeout_sec))
    }
}

/// Batched job-log commit tuning (§ store log appends).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Commit after this many buffered lines.
    pub log_commit_batch_size: usize,
    /// Commit after this long even if the batch is not full.
    pub log_commit_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_commit_batch_size: 64,
            log_commit_interval_ms: 500,
        }
    }
}

impl LoggingConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.log_commit_interval_ms.max(1))
    }
}

/// External helper commands backing the collaborator interfaces: one
/// executable per scientific step. The daemon wraps these in the stage
/// adapters of [`crate::stages::helpers`].
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HelperConfig {
    pub convert_cmd: Option<PathBuf>,
    pub solve_cmd: Option<PathBuf>,
    pub apply_cmd: Option<PathBuf>,
    pub image_cmd: Option<PathBuf>,
}

impl HelperConfig {
    /// True when every helper needed by the processing loop is configured.
    pub fn processing_enabled(&self) -> bool {
        self.convert_cmd.is_some()
            && self.solve_cmd.is_some()
            && self.apply_cmd.is_some()
            && self.image_cmd.is_some()
    }
}
