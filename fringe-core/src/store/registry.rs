//! Calibration registry store: versioned caltable entries with validity
//! windows and the ordered apply-list query.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cal::{order_applylist, CalKind, CaltableEntry, CaltableRef, CaltableStatus};
use crate::error::{PipelineError, Result};

use super::{classify, open_pool, with_op_timeout, WriteLock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caltables (
    caltable_id    TEXT PRIMARY KEY,
    kind           TEXT NOT NULL,
    path           TEXT NOT NULL,
    valid_from_mjd REAL NOT NULL,
    valid_to_mjd   REAL NOT NULL,
    status         TEXT NOT NULL,
    apply_order    INTEGER NOT NULL DEFAULT 0,
    CHECK (valid_to_mjd > valid_from_mjd)
);
CREATE INDEX IF NOT EXISTS idx_caltables_active
    ON caltables(kind, status, valid_from_mjd, valid_to_mjd);
"#;

/// Result of `register_caltable`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterOutcome {
    Inserted,
    /// An identical entry already exists; nothing changed.
    Unchanged,
}

/// Durable calibration registry backed by SQLite. Reads are unsynchronised
/// snapshots; writes are serialised through the store lock.
#[derive(Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<CaltableEntry> {
    let kind: String = row.try_get("kind").map_err(|e| classify("registry.read", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| classify("registry.read", e))?;
    Ok(CaltableEntry {
        caltable_id: row
            .try_get("caltable_id")
            .map_err(|e| classify("registry.read", e))?,
        kind: kind.parse()?,
        path: row.try_get("path").map_err(|e| classify("registry.read", e))?,
        valid_from_mjd: row
            .try_get("valid_from_mjd")
            .map_err(|e| classify("registry.read", e))?,
        valid_to_mjd: row
            .try_get("valid_to_mjd")
            .map_err(|e| classify("registry.read", e))?,
        status: status.parse()?,
        apply_order: row
            .try_get::<i64, _>("apply_order")
            .map_err(|e| classify("registry.read", e))? as i32,
    })
}

impl RegistryStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| classify("registry.schema", e))?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Register a new caltable entry.
    ///
    /// Registering an entry identical to an existing one is a no-op. An
    /// active entry whose window overlaps another active entry of the same
    /// kind is rejected with `ConstraintViolation`, as is reuse of a
    /// caltable id with different fields.
    pub async fn register_caltable(&self, entry: &CaltableEntry) -> Result<RegisterOutcome> {
        entry.check_window()?;
        with_op_timeout("registry.register_caltable", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("registry.register_caltable", e))?;

            if let Some(existing) = fetch_entry(&mut tx, &entry.caltable_id).await? {
                if existing == *entry {
                    return Ok(RegisterOutcome::Unchanged);
                }
                return Err(PipelineError::ConstraintViolation(format!(
                    "caltable {} already registered with different fields",
                    entry.caltable_id
                )));
            }

            if entry.status == CaltableStatus::Active {
                check_no_active_overlap(&mut tx, entry, None).await?;
            }

            insert_entry(&mut tx, entry).await?;
            tx.commit()
                .await
                .map_err(|e| classify("registry.register_caltable", e))?;
            debug!(caltable_id = %entry.caltable_id, kind = %entry.kind, "caltable registered");
            Ok(RegisterOutcome::Inserted)
        })
        .await
    }

    /// Retire an active entry.
    ///
    /// Retirement is only legal for the newest active entry of its kind
    /// over the affected window: retiring while an older active entry
    /// still overlaps is rejected.
    pub async fn retire_caltable(&self, caltable_id: &str) -> Result<()> {
        with_op_timeout("registry.retire_caltable", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("registry.retire_caltable", e))?;
            retire_in_tx(&mut tx, caltable_id).await?;
            tx.commit()
                .await
                .map_err(|e| classify("registry.retire_caltable", e))?;
            Ok(())
        })
        .await
    }

    /// Atomically retire `caltable_id` and activate `successor` in its
    /// place.
    pub async fn replace_caltable(
        &self,
        caltable_id: &str,
        successor: &CaltableEntry,
    ) -> Result<()> {
        successor.check_window()?;
        with_op_timeout("registry.replace_caltable", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("registry.replace_caltable", e))?;
            retire_in_tx(&mut tx, caltable_id).await?;
            if fetch_entry(&mut tx, &successor.caltable_id).await?.is_some() {
                return Err(PipelineError::ConstraintViolation(format!(
                    "successor caltable {} already registered",
                    successor.caltable_id
                )));
            }
            if successor.status == CaltableStatus::Active {
                check_no_active_overlap(&mut tx, successor, Some(caltable_id)).await?;
            }
            insert_entry(&mut tx, successor).await?;
            tx.commit()
                .await
                .map_err(|e| classify("registry.replace_caltable", e))?;
            debug!(retired = caltable_id, successor = %successor.caltable_id, "caltable replaced");
            Ok(())
        })
        .await
    }

    /// Mark a table failed (e.g. a solver produced an unusable solution).
    pub async fn mark_failed(&self, caltable_id: &str) -> Result<()> {
        with_op_timeout("registry.mark_failed", async {
            let _guard = self.write_lock.lock().await;
            let updated = sqlx::query("UPDATE caltables SET status = 'failed' WHERE caltable_id = ?")
                .bind(caltable_id)
                .execute(&self.pool)
                .await
                .map_err(|e| classify("registry.mark_failed", e))?;
            if updated.rows_affected() == 0 {
                return Err(PipelineError::NotFound(format!("caltable {caltable_id}")));
            }
            Ok(())
        })
        .await
    }

    /// The ordered apply-list for a target epoch: the single active entry
    /// of each kind whose validity window contains `mjd`, in the fixed
    /// kind order then by `apply_order`.
    pub async fn active_applylist(&self, mjd: f64) -> Result<Vec<CaltableRef>> {
        let entries = self.active_entries_at(mjd).await?;
        order_applylist(entries)
    }

    /// Raw snapshot of active entries covering `mjd`, without ordering.
    pub async fn active_entries_at(&self, mjd: f64) -> Result<Vec<CaltableEntry>> {
        with_op_timeout("registry.active_entries_at", async {
            let rows = sqlx::query(
                "SELECT caltable_id, kind, path, valid_from_mjd, valid_to_mjd, status, \
                 apply_order FROM caltables \
                 WHERE status = 'active' AND valid_from_mjd <= ? AND ? < valid_to_mjd",
            )
            .bind(mjd)
            .bind(mjd)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("registry.active_entries_at", e))?;
            rows.iter().map(entry_from_row).collect()
        })
        .await
    }

    pub async fn get_caltable(&self, caltable_id: &str) -> Result<CaltableEntry> {
        with_op_timeout("registry.get_caltable", async {
            let row = sqlx::query(
                "SELECT caltable_id, kind, path, valid_from_mjd, valid_to_mjd, status, \
                 apply_order FROM caltables WHERE caltable_id = ?",
            )
            .bind(caltable_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("registry.get_caltable", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("caltable {caltable_id}")))?;
            entry_from_row(&row)
        })
        .await
    }

    pub async fn list_caltables(
        &self,
        kind: Option<CalKind>,
        status: Option<CaltableStatus>,
    ) -> Result<Vec<CaltableEntry>> {
        with_op_timeout("registry.list_caltables", async {
            let rows = sqlx::query(
                "SELECT caltable_id, kind, path, valid_from_mjd, valid_to_mjd, status, \
                 apply_order FROM caltables \
                 WHERE (? IS NULL OR kind = ?) AND (? IS NULL OR status = ?) \
                 ORDER BY kind ASC, valid_from_mjd ASC, apply_order ASC",
            )
            .bind(kind.map(CalKind::as_str))
            .bind(kind.map(CalKind::as_str))
            .bind(status.map(CaltableStatus::as_str))
            .bind(status.map(CaltableStatus::as_str))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("registry.list_caltables", e))?;
            rows.iter().map(entry_from_row).collect()
        })
        .await
    }
}

async fn fetch_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    caltable_id: &str,
) -> Result<Option<CaltableEntry>> {
    let row = sqlx::query(
        "SELECT caltable_id, kind, path, valid_from_mjd, valid_to_mjd, status, apply_order \
         FROM caltables WHERE caltable_id = ?",
    )
    .bind(caltable_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| classify("registry.fetch_entry", e))?;
    row.as_ref().map(entry_from_row).transpose()
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &CaltableEntry,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO caltables (caltable_id, kind, path, valid_from_mjd, valid_to_mjd, status, \
         apply_order) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.caltable_id)
    .bind(entry.kind.as_str())
    .bind(&entry.path)
    .bind(entry.valid_from_mjd)
    .bind(entry.valid_to_mjd)
    .bind(entry.status.as_str())
    .bind(entry.apply_order as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| classify("registry.insert_entry", e))?;
    Ok(())
}

/// Reject an active insert whose window overlaps another active entry of
/// the same kind. `ignore` exempts the entry being replaced in the same
/// transaction.
async fn check_no_active_overlap(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &CaltableEntry,
    ignore: Option<&str>,
) -> Result<()> {
    let overlapping: Option<String> = sqlx::query_scalar(
        "SELECT caltable_id FROM caltables \
         WHERE kind = ? AND status = 'active' AND caltable_id != ? \
           AND (? IS NULL OR caltable_id != ?) \
           AND valid_from_mjd < ? AND valid_to_mjd > ? \
         LIMIT 1",
    )
    .bind(entry.kind.as_str())
    .bind(&entry.caltable_id)
    .bind(ignore)
    .bind(ignore)
    .bind(entry.valid_to_mjd)
    .bind(entry.valid_from_mjd)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| classify("registry.check_overlap", e))?;
    if let Some(other) = overlapping {
        return Err(PipelineError::ConstraintViolation(format!(
            "active {} window [{}, {}) overlaps {other}",
            entry.kind, entry.valid_from_mjd, entry.valid_to_mjd
        )));
    }
    Ok(())
}

async fn retire_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    caltable_id: &str,
) -> Result<()> {
    let entry = fetch_entry(tx, caltable_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("caltable {caltable_id}")))?;
    if entry.status != CaltableStatus::Active {
        return Err(PipelineError::ConstraintViolation(format!(
            "caltable {caltable_id} is {} and cannot be retired",
            entry.status.as_str()
        )));
    }
    let older: Option<String> = sqlx::query_scalar(
        "SELECT caltable_id FROM caltables \
         WHERE kind = ? AND status = 'active' AND caltable_id != ? \
           AND valid_from_mjd < ? AND valid_to_mjd > ? AND valid_from_mjd < ? \
         LIMIT 1",
    )
    .bind(entry.kind.as_str())
    .bind(caltable_id)
    .bind(entry.valid_to_mjd)
    .bind(entry.valid_from_mjd)
    .bind(entry.valid_from_mjd)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| classify("registry.retire", e))?;
    if let Some(older) = older {
        return Err(PipelineError::ConstraintViolation(format!(
            "cannot retire {caltable_id}: older active entry {older} still overlaps its window"
        )));
    }
    sqlx::query("UPDATE caltables SET status = 'retired' WHERE caltable_id = ?")
        .bind(caltable_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| classify("registry.retire", e))?;
    Ok(())
}
