//! Jobs store: workflow job records, per-stage execution rows, the batched
//! job log, and durable circuit-breaker state.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::LoggingConfig;
use crate::error::{PipelineError, Result};

use super::{classify, open_pool, with_op_timeout, WriteLock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_name TEXT NOT NULL,
    status        TEXT NOT NULL,
    inputs        TEXT NOT NULL,
    outputs       TEXT,
    stage_results TEXT,
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    finished_at   TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);
CREATE TABLE IF NOT EXISTS stage_executions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           INTEGER NOT NULL REFERENCES jobs(job_id),
    stage_name       TEXT NOT NULL,
    status           TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    finished_at      TEXT NOT NULL,
    duration_seconds REAL NOT NULL,
    inputs           TEXT,
    outputs          TEXT,
    error_message    TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS job_logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id    INTEGER NOT NULL REFERENCES jobs(job_id),
    line      TEXT NOT NULL,
    logged_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS circuit_breakers (
    name                 TEXT PRIMARY KEY,
    state                TEXT NOT NULL,
    failure_count        INTEGER NOT NULL DEFAULT 0,
    last_failure_time    TEXT,
    recovery_timeout_sec INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS dlq (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    component       TEXT NOT NULL,
    operation       TEXT NOT NULL,
    error_type      TEXT NOT NULL,
    error_message   TEXT NOT NULL,
    context         TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'pending',
    created_at      TEXT NOT NULL,
    resolved_at     TEXT,
    resolution_note TEXT
);
CREATE INDEX IF NOT EXISTS idx_dlq_status ON dlq(status, created_at);
CREATE INDEX IF NOT EXISTS idx_stage_executions_job ON stage_executions(job_id);
CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id);
"#;

/// Lifecycle status of a workflow job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::ConstraintViolation(format!(
                "unknown job status `{other}`"
            ))),
        }
    }
}

/// A workflow job row.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub job_id: i64,
    pub workflow_name: String,
    pub status: JobStatus,
    pub inputs: JsonValue,
    pub outputs: Option<JsonValue>,
    pub stage_results: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

/// Partial update applied by `update_job`; `None` fields keep the stored
/// value.
#[derive(Clone, Debug, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub outputs: Option<JsonValue>,
    pub stage_results: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<String>,
}

/// One persisted stage execution.
#[derive(Clone, Debug, PartialEq)]
pub struct StageExecutionRecord {
    pub id: i64,
    pub job_id: i64,
    pub stage_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub inputs: Option<JsonValue>,
    pub outputs: Option<JsonValue>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Insert payload for `record_stage_execution`; the duration is derived
/// from the timestamps.
#[derive(Clone, Debug)]
pub struct NewStageExecution {
    pub job_id: i64,
    pub stage_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inputs: Option<JsonValue>,
    pub outputs: Option<JsonValue>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// One line of the captured job log.
#[derive(Clone, Debug, PartialEq)]
pub struct JobLogLine {
    pub line: String,
    pub logged_at: DateTime<Utc>,
}

/// Filter for `list_jobs`.
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workflow_name: Option<String>,
    pub limit: Option<u32>,
}

/// Durable circuit-breaker state, keyed by breaker name.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerRecord {
    pub name: String,
    pub state: String,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub recovery_timeout_sec: u64,
}

/// Durable jobs store backed by SQLite.
#[derive(Clone)]
pub struct JobStore {
    pub(super) pool: SqlitePool,
    pub(super) write_lock: WriteLock,
}

impl fmt::Debug for JobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn json_column(value: Option<String>) -> Result<Option<JsonValue>> {
    value
        .map(|raw| serde_json::from_str(&raw).map_err(PipelineError::from))
        .transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let status: String = row.try_get("status").map_err(|e| classify("jobs.read", e))?;
    let inputs: String = row.try_get("inputs").map_err(|e| classify("jobs.read", e))?;
    Ok(JobRecord {
        job_id: row.try_get("job_id").map_err(|e| classify("jobs.read", e))?,
        workflow_name: row
            .try_get("workflow_name")
            .map_err(|e| classify("jobs.read", e))?,
        status: status.parse()?,
        inputs: serde_json::from_str(&inputs)?,
        outputs: json_column(row.try_get("outputs").map_err(|e| classify("jobs.read", e))?)?,
        stage_results: json_column(
            row.try_get("stage_results")
                .map_err(|e| classify("jobs.read", e))?,
        )?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| classify("jobs.read", e))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| classify("jobs.read", e))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| classify("jobs.read", e))?,
        retry_count: row
            .try_get::<i64, _>("retry_count")
            .map_err(|e| classify("jobs.read", e))? as u32,
        error_message: row
            .try_get("error_message")
            .map_err(|e| classify("jobs.read", e))?,
    })
}

fn stage_execution_from_row(row: &SqliteRow) -> Result<StageExecutionRecord> {
    Ok(StageExecutionRecord {
        id: row.try_get("id").map_err(|e| classify("jobs.read", e))?,
        job_id: row.try_get("job_id").map_err(|e| classify("jobs.read", e))?,
        stage_name: row
            .try_get("stage_name")
            .map_err(|e| classify("jobs.read", e))?,
        status: row.try_get("status").map_err(|e| classify("jobs.read", e))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| classify("jobs.read", e))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| classify("jobs.read", e))?,
        duration_seconds: row
            .try_get("duration_seconds")
            .map_err(|e| classify("jobs.read", e))?,
        inputs: json_column(row.try_get("inputs").map_err(|e| classify("jobs.read", e))?)?,
        outputs: json_column(row.try_get("outputs").map_err(|e| classify("jobs.read", e))?)?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| classify("jobs.read", e))?,
        retry_count: row
            .try_get::<i64, _>("retry_count")
            .map_err(|e| classify("jobs.read", e))? as u32,
    })
}

impl JobStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| classify("jobs.schema", e))?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn create_job(&self, workflow_name: &str, inputs: &JsonValue) -> Result<i64> {
        with_op_timeout("jobs.create_job", async {
            let _guard = self.write_lock.lock().await;
            let result = sqlx::query(
                "INSERT INTO jobs (workflow_name, status, inputs, created_at) \
                 VALUES (?, 'pending', ?, ?)",
            )
            .bind(workflow_name)
            .bind(serde_json::to_string(inputs)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| classify("jobs.create_job", e))?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    pub async fn update_job(&self, job_id: i64, patch: JobPatch) -> Result<()> {
        with_op_timeout("jobs.update_job", async {
            let _guard = self.write_lock.lock().await;
            let outputs = patch
                .outputs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let stage_results = patch
                .stage_results
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let updated = sqlx::query(
                "UPDATE jobs SET \
                   status        = COALESCE(?, status), \
                   outputs       = COALESCE(?, outputs), \
                   stage_results = COALESCE(?, stage_results), \
                   started_at    = COALESCE(?, started_at), \
                   finished_at   = COALESCE(?, finished_at), \
                   retry_count   = COALESCE(?, retry_count), \
                   error_message = COALESCE(?, error_message) \
                 WHERE job_id = ?",
            )
            .bind(patch.status.map(JobStatus::as_str))
            .bind(outputs)
            .bind(stage_results)
            .bind(patch.started_at)
            .bind(patch.finished_at)
            .bind(patch.retry_count.map(|n| n as i64))
            .bind(patch.error_message)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("jobs.update_job", e))?;
            if updated.rows_affected() == 0 {
                return Err(PipelineError::NotFound(format!("job {job_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<JobRecord> {
        with_op_timeout("jobs.get_job", async {
            let row = sqlx::query(
                "SELECT job_id, workflow_name, status, inputs, outputs, stage_results, \
                 created_at, started_at, finished_at, retry_count, error_message \
                 FROM jobs WHERE job_id = ?",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("jobs.get_job", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
            job_from_row(&row)
        })
        .await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>> {
        with_op_timeout("jobs.list_jobs", async {
            let rows = sqlx::query(
                "SELECT job_id, workflow_name, status, inputs, outputs, stage_results, \
                 created_at, started_at, finished_at, retry_count, error_message FROM jobs \
                 WHERE (? IS NULL OR status = ?) AND (? IS NULL OR workflow_name = ?) \
                 ORDER BY job_id DESC LIMIT ?",
            )
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.workflow_name.as_deref())
            .bind(filter.workflow_name.as_deref())
            .bind(filter.limit.unwrap_or(100) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("jobs.list_jobs", e))?;
            rows.iter().map(job_from_row).collect()
        })
        .await
    }

    /// Persist one stage execution. The duration is derived from the
    /// timestamps; a finish before the start is rejected.
    pub async fn record_stage_execution(
        &self,
        exec: NewStageExecution,
    ) -> Result<StageExecutionRecord> {
        if exec.finished_at < exec.started_at {
            return Err(PipelineError::ConstraintViolation(format!(
                "stage {} finished before it started",
                exec.stage_name
            )));
        }
        let duration_seconds =
            (exec.finished_at - exec.started_at).num_milliseconds() as f64 / 1_000.0;
        with_op_timeout("jobs.record_stage_execution", async {
            let _guard = self.write_lock.lock().await;
            let inputs = exec.inputs.as_ref().map(serde_json::to_string).transpose()?;
            let outputs = exec
                .outputs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let result = sqlx::query(
                "INSERT INTO stage_executions (job_id, stage_name, status, started_at, \
                 finished_at, duration_seconds, inputs, outputs, error_message, retry_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(exec.job_id)
            .bind(&exec.stage_name)
            .bind(&exec.status)
            .bind(exec.started_at)
            .bind(exec.finished_at)
            .bind(duration_seconds)
            .bind(inputs)
            .bind(outputs)
            .bind(exec.error_message.as_deref())
            .bind(exec.retry_count as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("jobs.record_stage_execution", e))?;
            Ok(StageExecutionRecord {
                id: result.last_insert_rowid(),
                job_id: exec.job_id,
                stage_name: exec.stage_name,
                status: exec.status,
                started_at: exec.started_at,
                finished_at: exec.finished_at,
                duration_seconds,
                inputs: exec.inputs,
                outputs: exec.outputs,
                error_message: exec.error_message,
                retry_count: exec.retry_count,
            })
        })
        .await
    }

    pub async fn list_stage_executions(&self, job_id: i64) -> Result<Vec<StageExecutionRecord>> {
        with_op_timeout("jobs.list_stage_executions", async {
            let rows = sqlx::query(
                "SELECT id, job_id, stage_name, status, started_at, finished_at, \
                 duration_seconds, inputs, outputs, error_message, retry_count \
                 FROM stage_executions WHERE job_id = ? ORDER BY id ASC",
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("jobs.list_stage_executions", e))?;
            rows.iter().map(stage_execution_from_row).collect()
        })
        .await
    }

    /// Append a batch of log lines in one commit.
    pub async fn append_job_log_batched(
        &self,
        job_id: i64,
        lines: &[(DateTime<Utc>, String)],
    ) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        with_op_timeout("jobs.append_job_log_batched", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("jobs.append_job_log_batched", e))?;
            for (logged_at, line) in lines {
                sqlx::query("INSERT INTO job_logs (job_id, line, logged_at) VALUES (?, ?, ?)")
                    .bind(job_id)
                    .bind(line)
                    .bind(logged_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify("jobs.append_job_log_batched", e))?;
            }
            tx.commit()
                .await
                .map_err(|e| classify("jobs.append_job_log_batched", e))?;
            Ok(())
        })
        .await
    }

    pub async fn list_job_log(&self, job_id: i64) -> Result<Vec<JobLogLine>> {
        with_op_timeout("jobs.list_job_log", async {
            let rows = sqlx::query(
                "SELECT line, logged_at FROM job_logs WHERE job_id = ? ORDER BY id ASC",
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("jobs.list_job_log", e))?;
            rows.iter()
                .map(|row| {
                    Ok(JobLogLine {
                        line: row.try_get("line").map_err(|e| classify("jobs.read", e))?,
                        logged_at: row
                            .try_get("logged_at")
                            .map_err(|e| classify("jobs.read", e))?,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn load_breaker(&self, name: &str) -> Result<Option<BreakerRecord>> {
        with_op_timeout("jobs.load_breaker", async {
            let row = sqlx::query(
                "SELECT name, state, failure_count, last_failure_time, recovery_timeout_sec \
                 FROM circuit_breakers WHERE name = ?",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("jobs.load_breaker", e))?;
            row.map(|row| {
                Ok(BreakerRecord {
                    name: row.try_get("name").map_err(|e| classify("jobs.read", e))?,
                    state: row.try_get("state").map_err(|e| classify("jobs.read", e))?,
                    failure_count: row
                        .try_get::<i64, _>("failure_count")
                        .map_err(|e| classify("jobs.read", e))? as u32,
                    last_failure_time: row
                        .try_get("last_failure_time")
                        .map_err(|e| classify("jobs.read", e))?,
                    recovery_timeout_sec: row
                        .try_get::<i64, _>("recovery_timeout_sec")
                        .map_err(|e| classify("jobs.read", e))? as u64,
                })
            })
            .transpose()
        })
        .await
    }

    pub async fn save_breaker(&self, record: &BreakerRecord) -> Result<()> {
        with_op_timeout("jobs.save_breaker", async {
            let _guard = self.write_lock.lock().await;
            sqlx::query(
                "INSERT INTO circuit_breakers (name, state, failure_count, last_failure_time, \
                 recovery_timeout_sec) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(name) DO UPDATE SET \
                   state = excluded.state, failure_count = excluded.failure_count, \
                   last_failure_time = excluded.last_failure_time, \
                   recovery_timeout_sec = excluded.recovery_timeout_sec",
            )
            .bind(&record.name)
            .bind(&record.state)
            .bind(record.failure_count as i64)
            .bind(record.last_failure_time)
            .bind(record.recovery_timeout_sec as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("jobs.save_breaker", e))?;
            Ok(())
        })
        .await
    }
}

/// Batched append-only writer for a job's log.
///
/// Lines buffer in memory and commit when the batch size or commit
/// interval is reached, whichever comes first. Stage boundaries call
/// [`JobLogWriter::flush`], which commits unconditionally.
pub struct JobLogWriter {
    store: JobStore,
    job_id: i64,
    batch_size: usize,
    interval: std::time::Duration,
    buf: Mutex<LogBuf>,
}

struct LogBuf {
    lines: Vec<(DateTime<Utc>, String)>,
    last_commit: Instant,
}

impl fmt::Debug for JobLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogWriter")
            .field("job_id", &self.job_id)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl JobLogWriter {
    pub fn new(store: JobStore, job_id: i64, config: &LoggingConfig) -> Self {
        Self {
            store,
            job_id,
            batch_size: config.log_commit_batch_size.max(1),
            interval: config.commit_interval(),
            buf: Mutex::new(LogBuf {
                lines: Vec::new(),
                last_commit: Instant::now(),
            }),
        }
    }

    /// Buffer one line, committing if the batch is full or the commit
    /// interval has elapsed.
    pub async fn append(&self, line: impl Into<String>) -> Result<()> {
        let mut buf = self.buf.lock().await;
        buf.lines.push((Utc::now(), line.into()));
        if buf.lines.len() >= self.batch_size || buf.last_commit.elapsed() >= self.interval {
            self.commit(&mut buf).await?;
        }
        Ok(())
    }

    /// Commit any buffered lines immediately.
    pub async fn flush(&self) -> Result<()> {
        let mut buf = self.buf.lock().await;
        self.commit(&mut buf).await
    }

    async fn commit(&self, buf: &mut LogBuf) -> Result<()> {
        if !buf.lines.is_empty() {
            let lines = std::mem::take(&mut buf.lines);
            self.store.append_job_log_batched(self.job_id, &lines).await?;
        }
        buf.last_commit = Instant::now();
        Ok(())
    }
}

impl Drop for JobLogWriter {
    fn drop(&mut self) {
        let pending = self.buf.get_mut().lines.len();
        if pending > 0 {
            warn!(
                job_id = self.job_id,
                pending, "job log writer dropped with uncommitted lines"
            );
        }
    }
}
