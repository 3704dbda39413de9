//! Ingest queue store: observation groups and their sub-band files.
//!
//! The group state machine is enforced here, inside per-store
//! transactions, so every caller observes the same transition rules:
//!
//! ```text
//!           first-file
//!  (start) ───────────► collecting ──► pending ──► in_progress ──► completed
//!                           │                           │   ▲
//!                           │ timeout / manual          │   │ stalled requeue
//!                           ▼                           ▼   │
//!                         failed ◄──────────────────── failed
//! ```
//!
//! Claims are strictly `pending → in_progress` and stamp the attempt
//! counter; stalled in-progress groups are re-queued by the housekeeper
//! until the attempt budget is exhausted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};

use super::{classify, open_pool, with_op_timeout, WriteLock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    group_id      TEXT PRIMARY KEY,
    expected_count INTEGER NOT NULL,
    state         TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    group_id      TEXT NOT NULL REFERENCES groups(group_id),
    subband_index INTEGER NOT NULL,
    path          TEXT NOT NULL,
    arrived_at    TEXT NOT NULL,
    PRIMARY KEY (group_id, subband_index)
);
CREATE INDEX IF NOT EXISTS idx_groups_state ON groups(state, created_at);
"#;

/// Lifecycle state of an observation group.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Collecting,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl GroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupState::Collecting => "collecting",
            GroupState::Pending => "pending",
            GroupState::InProgress => "in_progress",
            GroupState::Completed => "completed",
            GroupState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GroupState::Completed | GroupState::Failed)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collecting" => Ok(GroupState::Collecting),
            "pending" => Ok(GroupState::Pending),
            "in_progress" => Ok(GroupState::InProgress),
            "completed" => Ok(GroupState::Completed),
            "failed" => Ok(GroupState::Failed),
            other => Err(PipelineError::ConstraintViolation(format!(
                "unknown group state `{other}`"
            ))),
        }
    }
}

/// One sub-band file recorded against a group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubbandFile {
    pub subband_index: u32,
    pub path: String,
    pub arrived_at: DateTime<Utc>,
}

/// Queue row for an observation group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupRow {
    pub group_id: String,
    pub expected_count: u32,
    pub state: GroupState,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Group row plus its recorded files.
#[derive(Clone, Debug)]
pub struct GroupSnapshot {
    pub group: GroupRow,
    pub files: Vec<SubbandFile>,
}

/// Result of recording one file arrival.
#[derive(Clone, Debug)]
pub struct ArrivalOutcome {
    pub group_id: String,
    pub state: GroupState,
    pub file_count: u32,
    /// The arrival completed the group and promoted it to pending.
    pub promoted: bool,
    /// The sub-band was already recorded; the path was refreshed and no
    /// state advanced.
    pub duplicate: bool,
}

/// A claimed group handed to a worker, attempt counter already stamped.
#[derive(Clone, Debug)]
pub struct GroupClaim {
    pub group: GroupRow,
    pub files: Vec<SubbandFile>,
}

/// Filter for `list_groups`.
#[derive(Clone, Debug, Default)]
pub struct GroupFilter {
    pub state: Option<GroupState>,
    pub limit: Option<u32>,
}

/// Counts reported by a stalled-group sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequeueOutcome {
    pub requeued: u64,
    pub failed: u64,
}

/// Durable queue store backed by SQLite.
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn group_from_row(row: &SqliteRow) -> Result<GroupRow> {
    let state: String = row.try_get("state").map_err(|e| classify("queue.read", e))?;
    Ok(GroupRow {
        group_id: row
            .try_get("group_id")
            .map_err(|e| classify("queue.read", e))?,
        expected_count: row
            .try_get::<i64, _>("expected_count")
            .map_err(|e| classify("queue.read", e))? as u32,
        state: state.parse()?,
        attempt_count: row
            .try_get::<i64, _>("attempt_count")
            .map_err(|e| classify("queue.read", e))? as u32,
        created_at: row
            .try_get("created_at")
            .map_err(|e| classify("queue.read", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| classify("queue.read", e))?,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<SubbandFile> {
    Ok(SubbandFile {
        subband_index: row
            .try_get::<i64, _>("subband_index")
            .map_err(|e| classify("queue.read", e))? as u32,
        path: row.try_get("path").map_err(|e| classify("queue.read", e))?,
        arrived_at: row
            .try_get("arrived_at")
            .map_err(|e| classify("queue.read", e))?,
    })
}

impl QueueStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| classify("queue.schema", e))?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create the group row if missing; refresh `expected_count` while the
    /// group is still collecting. `expected_count == 0` promotes straight
    /// to pending.
    pub async fn upsert_group(&self, group_id: &str, expected_count: u32) -> Result<GroupRow> {
        with_op_timeout("queue.upsert_group", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("queue.upsert_group", e))?;
            ensure_group(&mut tx, group_id, expected_count).await?;
            if let Some(row) = fetch_group(&mut tx, group_id).await? {
                if row.state == GroupState::Collecting && row.expected_count != expected_count {
                    let now = Utc::now();
                    let count = file_count(&mut tx, group_id).await?;
                    let state = if count >= expected_count {
                        GroupState::Pending
                    } else {
                        GroupState::Collecting
                    };
                    sqlx::query(
                        "UPDATE groups SET expected_count = ?, state = ?, updated_at = ? \
                         WHERE group_id = ?",
                    )
                    .bind(expected_count as i64)
                    .bind(state.as_str())
                    .bind(now)
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify("queue.upsert_group", e))?;
                }
            }
            let row = fetch_group(&mut tx, group_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("group {group_id}")))?;
            tx.commit()
                .await
                .map_err(|e| classify("queue.upsert_group", e))?;
            Ok(row)
        })
        .await
    }

    /// Record one file arrival in a single transaction, applying the group
    /// assembly rules: first file creates the group, a duplicate sub-band
    /// refreshes the path without advancing state, and the final file
    /// promotes the group to pending.
    pub async fn record_file_arrival(
        &self,
        group_id: &str,
        subband_index: u32,
        path: &str,
        expected_count: u32,
    ) -> Result<ArrivalOutcome> {
        with_op_timeout("queue.record_file_arrival", async {
            let _guard = self.write_lock.lock().await;
            let now = Utc::now();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("queue.record_file_arrival", e))?;

            ensure_group(&mut tx, group_id, expected_count).await?;
            let group = fetch_group(&mut tx, group_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("group {group_id}")))?;

            let duplicate = sqlx::query(
                "SELECT 1 FROM files WHERE group_id = ? AND subband_index = ?",
            )
            .bind(group_id)
            .bind(subband_index as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify("queue.record_file_arrival", e))?
            .is_some();

            if duplicate {
                sqlx::query(
                    "UPDATE files SET path = ?, arrived_at = ? \
                     WHERE group_id = ? AND subband_index = ?",
                )
                .bind(path)
                .bind(now)
                .bind(group_id)
                .bind(subband_index as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify("queue.record_file_arrival", e))?;
            } else {
                sqlx::query(
                    "INSERT INTO files (group_id, subband_index, path, arrived_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(group_id)
                .bind(subband_index as i64)
                .bind(path)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify("queue.record_file_arrival", e))?;
            }

            let file_count = file_count(&mut tx, group_id).await?;
            let mut state = group.state;
            let mut promoted = false;
            if !duplicate && state == GroupState::Collecting {
                if file_count >= group.expected_count {
                    state = GroupState::Pending;
                    promoted = true;
                }
                sqlx::query("UPDATE groups SET state = ?, updated_at = ? WHERE group_id = ?")
                    .bind(state.as_str())
                    .bind(now)
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify("queue.record_file_arrival", e))?;
            }

            tx.commit()
                .await
                .map_err(|e| classify("queue.record_file_arrival", e))?;

            debug!(group_id, subband_index, %state, duplicate, "file arrival recorded");
            Ok(ArrivalOutcome {
                group_id: group_id.to_string(),
                state,
                file_count,
                promoted,
                duplicate,
            })
        })
        .await
    }

    /// Atomically claim the oldest pending group: transition it to
    /// in-progress and stamp the attempt counter.
    pub async fn claim_next_pending(&self) -> Result<Option<GroupClaim>> {
        with_op_timeout("queue.claim_next_pending", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("queue.claim_next_pending", e))?;
            let row = sqlx::query(
                "SELECT group_id, expected_count, state, attempt_count, created_at, updated_at \
                 FROM groups WHERE state = 'pending' \
                 ORDER BY created_at ASC, group_id ASC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify("queue.claim_next_pending", e))?;
            let Some(row) = row else {
                return Ok(None);
            };
            let mut group = group_from_row(&row)?;

            let now = Utc::now();
            let updated = sqlx::query(
                "UPDATE groups SET state = 'in_progress', attempt_count = attempt_count + 1, \
                 updated_at = ? WHERE group_id = ? AND state = 'pending'",
            )
            .bind(now)
            .bind(&group.group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("queue.claim_next_pending", e))?;
            if updated.rows_affected() != 1 {
                return Err(PipelineError::Conflict(format!(
                    "group {} was claimed concurrently",
                    group.group_id
                )));
            }
            group.state = GroupState::InProgress;
            group.attempt_count += 1;
            group.updated_at = now;

            let files = fetch_files(&mut tx, &group.group_id).await?;
            tx.commit()
                .await
                .map_err(|e| classify("queue.claim_next_pending", e))?;
            debug!(group_id = %group.group_id, attempt = group.attempt_count, "group claimed");
            Ok(Some(GroupClaim { group, files }))
        })
        .await
    }

    /// Refresh the liveness timestamp of an in-progress group.
    pub async fn heartbeat(&self, group_id: &str) -> Result<()> {
        with_op_timeout("queue.heartbeat", async {
            let _guard = self.write_lock.lock().await;
            let updated = sqlx::query(
                "UPDATE groups SET updated_at = ? WHERE group_id = ? AND state = 'in_progress'",
            )
            .bind(Utc::now())
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("queue.heartbeat", e))?;
            if updated.rows_affected() == 0 {
                return Err(PipelineError::NotFound(format!(
                    "in-progress group {group_id}"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Apply an explicit state transition. Only the transitions of the
    /// group state machine are admitted; marking a group with its current
    /// state is a no-op.
    pub async fn mark_group(&self, group_id: &str, to: GroupState) -> Result<()> {
        with_op_timeout("queue.mark_group", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("queue.mark_group", e))?;
            let group = fetch_group(&mut tx, group_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("group {group_id}")))?;
            if group.state == to {
                return Ok(());
            }
            let legal = matches!(
                (group.state, to),
                (GroupState::Collecting, GroupState::Failed)
                    | (GroupState::InProgress, GroupState::Completed)
                    | (GroupState::InProgress, GroupState::Failed)
                    | (GroupState::InProgress, GroupState::Pending)
            );
            if !legal {
                return Err(PipelineError::ConstraintViolation(format!(
                    "illegal group transition {} -> {} for {group_id}",
                    group.state, to
                )));
            }
            sqlx::query("UPDATE groups SET state = ?, updated_at = ? WHERE group_id = ?")
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify("queue.mark_group", e))?;
            tx.commit()
                .await
                .map_err(|e| classify("queue.mark_group", e))?;
            debug!(group_id, from = %group.state, to = %to, "group transition");
            Ok(())
        })
        .await
    }

    pub async fn get_group(&self, group_id: &str) -> Result<GroupSnapshot> {
        with_op_timeout("queue.get_group", async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| classify("queue.get_group", e))?;
            let row = sqlx::query(
                "SELECT group_id, expected_count, state, attempt_count, created_at, updated_at \
                 FROM groups WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| classify("queue.get_group", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("group {group_id}")))?;
            let group = group_from_row(&row)?;
            let rows = sqlx::query(
                "SELECT subband_index, path, arrived_at FROM files \
                 WHERE group_id = ? ORDER BY subband_index ASC",
            )
            .bind(group_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| classify("queue.get_group", e))?;
            let files = rows
                .iter()
                .map(file_from_row)
                .collect::<Result<Vec<_>>>()?;
            Ok(GroupSnapshot { group, files })
        })
        .await
    }

    pub async fn list_groups(&self, filter: GroupFilter) -> Result<Vec<GroupRow>> {
        with_op_timeout("queue.list_groups", async {
            let limit = filter.limit.unwrap_or(1_000) as i64;
            let rows = match filter.state {
                Some(state) => {
                    sqlx::query(
                        "SELECT group_id, expected_count, state, attempt_count, created_at, \
                         updated_at FROM groups WHERE state = ? \
                         ORDER BY created_at ASC, group_id ASC LIMIT ?",
                    )
                    .bind(state.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query(
                        "SELECT group_id, expected_count, state, attempt_count, created_at, \
                         updated_at FROM groups ORDER BY created_at ASC, group_id ASC LIMIT ?",
                    )
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .map_err(|e| classify("queue.list_groups", e))?;
            rows.iter().map(group_from_row).collect()
        })
        .await
    }

    /// Housekeeping: groups still collecting after `idle_for` with no new
    /// arrivals are marked failed. Returns the number of groups failed.
    pub async fn expire_collecting(&self, idle_for: Duration) -> Result<u64> {
        with_op_timeout("queue.expire_collecting", async {
            let _guard = self.write_lock.lock().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(idle_for).unwrap_or(chrono::Duration::zero());
            let updated = sqlx::query(
                "UPDATE groups SET state = 'failed', updated_at = ? \
                 WHERE state = 'collecting' AND updated_at < ?",
            )
            .bind(Utc::now())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("queue.expire_collecting", e))?;
            Ok(updated.rows_affected())
        })
        .await
    }

    /// Housekeeping: in-progress groups without a heartbeat for `idle_for`
    /// are returned to pending while attempts remain, otherwise failed.
    pub async fn requeue_stalled(
        &self,
        idle_for: Duration,
        max_attempts: u32,
    ) -> Result<RequeueOutcome> {
        with_op_timeout("queue.requeue_stalled", async {
            let _guard = self.write_lock.lock().await;
            let now = Utc::now();
            let cutoff =
                now - chrono::Duration::from_std(idle_for).unwrap_or(chrono::Duration::zero());
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("queue.requeue_stalled", e))?;
            let requeued = sqlx::query(
                "UPDATE groups SET state = 'pending', updated_at = ? \
                 WHERE state = 'in_progress' AND updated_at < ? AND attempt_count < ?",
            )
            .bind(now)
            .bind(cutoff)
            .bind(max_attempts as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("queue.requeue_stalled", e))?
            .rows_affected();
            let failed = sqlx::query(
                "UPDATE groups SET state = 'failed', updated_at = ? \
                 WHERE state = 'in_progress' AND updated_at < ? AND attempt_count >= ?",
            )
            .bind(now)
            .bind(cutoff)
            .bind(max_attempts as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("queue.requeue_stalled", e))?
            .rows_affected();
            tx.commit()
                .await
                .map_err(|e| classify("queue.requeue_stalled", e))?;
            Ok(RequeueOutcome { requeued, failed })
        })
        .await
    }
}

async fn ensure_group(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    group_id: &str,
    expected_count: u32,
) -> Result<()> {
    let exists = sqlx::query("SELECT 1 FROM groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| classify("queue.ensure_group", e))?
        .is_some();
    if exists {
        return Ok(());
    }
    let now = Utc::now();
    // An expected count of zero means there is nothing to collect.
    let state = if expected_count == 0 {
        GroupState::Pending
    } else {
        GroupState::Collecting
    };
    sqlx::query(
        "INSERT INTO groups (group_id, expected_count, state, attempt_count, created_at, \
         updated_at) VALUES (?, ?, ?, 0, ?, ?)",
    )
    .bind(group_id)
    .bind(expected_count as i64)
    .bind(state.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| classify("queue.ensure_group", e))?;
    Ok(())
}

async fn fetch_group(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    group_id: &str,
) -> Result<Option<GroupRow>> {
    let row = sqlx::query(
        "SELECT group_id, expected_count, state, attempt_count, created_at, updated_at \
         FROM groups WHERE group_id = ?",
    )
    .bind(group_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| classify("queue.fetch_group", e))?;
    row.as_ref().map(group_from_row).transpose()
}

async fn file_count(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    group_id: &str,
) -> Result<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE group_id = ?")
        .bind(group_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| classify("queue.file_count", e))?;
    Ok(count as u32)
}

async fn fetch_files(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    group_id: &str,
) -> Result<Vec<SubbandFile>> {
    let rows = sqlx::query(
        "SELECT subband_index, path, arrived_at FROM files \
         WHERE group_id = ? ORDER BY subband_index ASC",
    )
    .bind(group_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| classify("queue.fetch_files", e))?;
    rows.iter().map(file_from_row).collect()
}
