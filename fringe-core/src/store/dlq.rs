//! Dead Letter Queue: durable records of terminal failures, kept for
//! manual retry or resolution.
//!
//! The table lives in the jobs store file (the records are job-adjacent
//! bookkeeping) but is exposed through its own handle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};

use super::jobs::JobStore;
use super::{classify, with_op_timeout, WriteLock};

/// Lifecycle status of a DLQ item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Failed,
}

impl DlqStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Retrying => "retrying",
            DlqStatus::Resolved => "resolved",
            DlqStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DlqStatus::Resolved | DlqStatus::Failed)
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "retrying" => Ok(DlqStatus::Retrying),
            "resolved" => Ok(DlqStatus::Resolved),
            "failed" => Ok(DlqStatus::Failed),
            other => Err(PipelineError::ConstraintViolation(format!(
                "unknown dlq status `{other}`"
            ))),
        }
    }
}

/// A captured terminal failure.
#[derive(Clone, Debug, PartialEq)]
pub struct DlqRecord {
    pub id: i64,
    pub component: String,
    pub operation: String,
    pub error_type: String,
    pub error_message: String,
    pub context: JsonValue,
    pub retry_count: u32,
    pub status: DlqStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

/// Insert payload for `enqueue`.
#[derive(Clone, Debug)]
pub struct NewDlqItem {
    pub component: String,
    pub operation: String,
    pub error_type: String,
    pub error_message: String,
    /// Redacted context snapshot captured at the failure site.
    pub context: JsonValue,
}

/// Filter for `list`.
#[derive(Clone, Debug, Default)]
pub struct DlqFilter {
    pub status: Option<DlqStatus>,
    pub component: Option<String>,
    pub limit: Option<u32>,
}

/// Handle over the DLQ table.
#[derive(Clone)]
pub struct DeadLetterStore {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<DlqRecord> {
    let status: String = row.try_get("status").map_err(|e| classify("dlq.read", e))?;
    let context: String = row.try_get("context").map_err(|e| classify("dlq.read", e))?;
    Ok(DlqRecord {
        id: row.try_get("id").map_err(|e| classify("dlq.read", e))?,
        component: row
            .try_get("component")
            .map_err(|e| classify("dlq.read", e))?,
        operation: row
            .try_get("operation")
            .map_err(|e| classify("dlq.read", e))?,
        error_type: row
            .try_get("error_type")
            .map_err(|e| classify("dlq.read", e))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| classify("dlq.read", e))?,
        context: serde_json::from_str(&context)?,
        retry_count: row
            .try_get::<i64, _>("retry_count")
            .map_err(|e| classify("dlq.read", e))? as u32,
        status: status.parse()?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| classify("dlq.read", e))?,
        resolved_at: row
            .try_get("resolved_at")
            .map_err(|e| classify("dlq.read", e))?,
        resolution_note: row
            .try_get("resolution_note")
            .map_err(|e| classify("dlq.read", e))?,
    })
}

impl DeadLetterStore {
    /// Attach to the jobs store file, which carries the DLQ table.
    pub fn attach(jobs: &JobStore) -> Self {
        Self {
            pool: jobs.pool.clone(),
            write_lock: jobs.write_lock.clone(),
        }
    }

    pub async fn enqueue(&self, item: NewDlqItem) -> Result<i64> {
        with_op_timeout("dlq.enqueue", async {
            let _guard = self.write_lock.lock().await;
            let result = sqlx::query(
                "INSERT INTO dlq (component, operation, error_type, error_message, context, \
                 retry_count, status, created_at) VALUES (?, ?, ?, ?, ?, 0, 'pending', ?)",
            )
            .bind(&item.component)
            .bind(&item.operation)
            .bind(&item.error_type)
            .bind(&item.error_message)
            .bind(serde_json::to_string(&item.context)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| classify("dlq.enqueue", e))?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    pub async fn get(&self, id: i64) -> Result<DlqRecord> {
        with_op_timeout("dlq.get", async {
            let row = sqlx::query(
                "SELECT id, component, operation, error_type, error_message, context, \
                 retry_count, status, created_at, resolved_at, resolution_note \
                 FROM dlq WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("dlq.get", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("dlq item {id}")))?;
            record_from_row(&row)
        })
        .await
    }

    pub async fn list(&self, filter: DlqFilter) -> Result<Vec<DlqRecord>> {
        with_op_timeout("dlq.list", async {
            let rows = sqlx::query(
                "SELECT id, component, operation, error_type, error_message, context, \
                 retry_count, status, created_at, resolved_at, resolution_note FROM dlq \
                 WHERE (? IS NULL OR status = ?) AND (? IS NULL OR component = ?) \
                 ORDER BY created_at ASC, id ASC LIMIT ?",
            )
            .bind(filter.status.map(DlqStatus::as_str))
            .bind(filter.status.map(DlqStatus::as_str))
            .bind(filter.component.as_deref())
            .bind(filter.component.as_deref())
            .bind(filter.limit.unwrap_or(100) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("dlq.list", e))?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    /// Transition an item for retry, resolution, or terminal failure.
    ///
    /// Pending and retrying items move freely between each other and into
    /// the terminal states; terminal items are immutable. Entering
    /// `retrying` bumps the retry counter; entering a terminal state
    /// stamps `resolved_at` and records the note.
    pub async fn transition(
        &self,
        id: i64,
        to: DlqStatus,
        resolution_note: Option<String>,
    ) -> Result<DlqRecord> {
        with_op_timeout("dlq.transition", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("dlq.transition", e))?;
            let row = sqlx::query(
                "SELECT id, component, operation, error_type, error_message, context, \
                 retry_count, status, created_at, resolved_at, resolution_note \
                 FROM dlq WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify("dlq.transition", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("dlq item {id}")))?;
            let mut record = record_from_row(&row)?;

            if record.status.is_terminal() || record.status == to {
                return Err(PipelineError::ConstraintViolation(format!(
                    "illegal dlq transition {} -> {to} for item {id}",
                    record.status
                )));
            }

            record.status = to;
            if to == DlqStatus::Retrying {
                record.retry_count += 1;
            }
            if to.is_terminal() {
                record.resolved_at = Some(Utc::now());
                record.resolution_note = resolution_note.clone();
            }

            sqlx::query(
                "UPDATE dlq SET status = ?, retry_count = ?, resolved_at = ?, \
                 resolution_note = ? WHERE id = ?",
            )
            .bind(record.status.as_str())
            .bind(record.retry_count as i64)
            .bind(record.resolved_at)
            .bind(record.resolution_note.as_deref())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("dlq.transition", e))?;
            tx.commit()
                .await
                .map_err(|e| classify("dlq.transition", e))?;
            Ok(record)
        })
        .await
    }
}
