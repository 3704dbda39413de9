//! Product store: the measurement-set index and derived image artifacts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};

use super::{classify, open_pool, with_op_timeout, WriteLock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ms_index (
    path        TEXT PRIMARY KEY,
    start_mjd   REAL NOT NULL,
    mid_mjd     REAL NOT NULL,
    end_mjd     REAL NOT NULL,
    stage       TEXT NOT NULL,
    cal_applied INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS images (
    path    TEXT PRIMARY KEY,
    ms_path TEXT NOT NULL REFERENCES ms_index(path),
    beam    REAL NOT NULL,
    noise   REAL NOT NULL,
    pbcor   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_ms_index_mid ON ms_index(mid_mjd);
"#;

/// Processing stage of a measurement set; advances monotonically.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsStage {
    Converted,
    Calibrated,
    Imaged,
}

impl MsStage {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MsStage::Converted => "converted",
            MsStage::Calibrated => "calibrated",
            MsStage::Imaged => "imaged",
        }
    }
}

impl fmt::Display for MsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "converted" => Ok(MsStage::Converted),
            "calibrated" => Ok(MsStage::Calibrated),
            "imaged" => Ok(MsStage::Imaged),
            other => Err(PipelineError::ConstraintViolation(format!(
                "unknown ms stage `{other}`"
            ))),
        }
    }
}

/// One row of the measurement-set index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsRecord {
    pub path: String,
    pub start_mjd: f64,
    pub mid_mjd: f64,
    pub end_mjd: f64,
    pub stage: MsStage,
    pub cal_applied: bool,
}

/// A derived image artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: String,
    pub ms_path: String,
    pub beam: f64,
    pub noise: f64,
    pub pbcor: bool,
}

/// Filter for `query_products`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProductFilter {
    pub stage: Option<MsStage>,
    pub cal_applied: Option<bool>,
    pub min_mid_mjd: Option<f64>,
    pub max_mid_mjd: Option<f64>,
    pub limit: Option<u32>,
}

/// Durable product store backed by SQLite. Rows are never deleted by the
/// control plane.
#[derive(Clone)]
pub struct ProductStore {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl fmt::Debug for ProductStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn ms_from_row(row: &SqliteRow) -> Result<MsRecord> {
    let stage: String = row.try_get("stage").map_err(|e| classify("products.read", e))?;
    Ok(MsRecord {
        path: row.try_get("path").map_err(|e| classify("products.read", e))?,
        start_mjd: row
            .try_get("start_mjd")
            .map_err(|e| classify("products.read", e))?,
        mid_mjd: row
            .try_get("mid_mjd")
            .map_err(|e| classify("products.read", e))?,
        end_mjd: row
            .try_get("end_mjd")
            .map_err(|e| classify("products.read", e))?,
        stage: stage.parse()?,
        cal_applied: row
            .try_get::<i64, _>("cal_applied")
            .map_err(|e| classify("products.read", e))?
            != 0,
    })
}

fn image_from_row(row: &SqliteRow) -> Result<ImageRecord> {
    Ok(ImageRecord {
        path: row.try_get("path").map_err(|e| classify("products.read", e))?,
        ms_path: row
            .try_get("ms_path")
            .map_err(|e| classify("products.read", e))?,
        beam: row.try_get("beam").map_err(|e| classify("products.read", e))?,
        noise: row.try_get("noise").map_err(|e| classify("products.read", e))?,
        pbcor: row
            .try_get::<i64, _>("pbcor")
            .map_err(|e| classify("products.read", e))?
            != 0,
    })
}

impl ProductStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| classify("products.schema", e))?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Insert or update a measurement-set row. The stage only ever
    /// advances; an update carrying an earlier stage keeps the stored one.
    pub async fn upsert_ms_index(&self, record: &MsRecord) -> Result<MsRecord> {
        with_op_timeout("products.upsert_ms_index", async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("products.upsert_ms_index", e))?;
            let existing = sqlx::query(
                "SELECT path, start_mjd, mid_mjd, end_mjd, stage, cal_applied \
                 FROM ms_index WHERE path = ?",
            )
            .bind(&record.path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify("products.upsert_ms_index", e))?;

            let merged = match existing {
                Some(row) => {
                    let current = ms_from_row(&row)?;
                    MsRecord {
                        stage: if record.stage.rank() >= current.stage.rank() {
                            record.stage
                        } else {
                            current.stage
                        },
                        cal_applied: record.cal_applied || current.cal_applied,
                        ..record.clone()
                    }
                }
                None => record.clone(),
            };

            sqlx::query(
                "INSERT INTO ms_index (path, start_mjd, mid_mjd, end_mjd, stage, cal_applied) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(path) DO UPDATE SET \
                   start_mjd = excluded.start_mjd, mid_mjd = excluded.mid_mjd, \
                   end_mjd = excluded.end_mjd, stage = excluded.stage, \
                   cal_applied = excluded.cal_applied",
            )
            .bind(&merged.path)
            .bind(merged.start_mjd)
            .bind(merged.mid_mjd)
            .bind(merged.end_mjd)
            .bind(merged.stage.as_str())
            .bind(merged.cal_applied as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("products.upsert_ms_index", e))?;
            tx.commit()
                .await
                .map_err(|e| classify("products.upsert_ms_index", e))?;
            Ok(merged)
        })
        .await
    }

    /// Record an image artifact. Re-imaging the same path refreshes the
    /// beam/noise figures.
    pub async fn insert_image(&self, record: &ImageRecord) -> Result<()> {
        with_op_timeout("products.insert_image", async {
            let _guard = self.write_lock.lock().await;
            sqlx::query(
                "INSERT INTO images (path, ms_path, beam, noise, pbcor) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(path) DO UPDATE SET \
                   ms_path = excluded.ms_path, beam = excluded.beam, \
                   noise = excluded.noise, pbcor = excluded.pbcor",
            )
            .bind(&record.path)
            .bind(&record.ms_path)
            .bind(record.beam)
            .bind(record.noise)
            .bind(record.pbcor as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("products.insert_image", e))?;
            Ok(())
        })
        .await
    }

    pub async fn get_ms(&self, path: &str) -> Result<MsRecord> {
        with_op_timeout("products.get_ms", async {
            let row = sqlx::query(
                "SELECT path, start_mjd, mid_mjd, end_mjd, stage, cal_applied \
                 FROM ms_index WHERE path = ?",
            )
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("products.get_ms", e))?
            .ok_or_else(|| PipelineError::NotFound(format!("measurement set {path}")))?;
            ms_from_row(&row)
        })
        .await
    }

    pub async fn query_products(&self, filter: ProductFilter) -> Result<Vec<MsRecord>> {
        with_op_timeout("products.query_products", async {
            let rows = sqlx::query(
                "SELECT path, start_mjd, mid_mjd, end_mjd, stage, cal_applied FROM ms_index \
                 WHERE (? IS NULL OR stage = ?) \
                   AND (? IS NULL OR cal_applied = ?) \
                   AND (? IS NULL OR mid_mjd >= ?) \
                   AND (? IS NULL OR mid_mjd < ?) \
                 ORDER BY mid_mjd ASC, path ASC LIMIT ?",
            )
            .bind(filter.stage.map(MsStage::as_str))
            .bind(filter.stage.map(MsStage::as_str))
            .bind(filter.cal_applied.map(|b| b as i64))
            .bind(filter.cal_applied.map(|b| b as i64))
            .bind(filter.min_mid_mjd)
            .bind(filter.min_mid_mjd)
            .bind(filter.max_mid_mjd)
            .bind(filter.max_mid_mjd)
            .bind(filter.limit.unwrap_or(1_000) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("products.query_products", e))?;
            rows.iter().map(ms_from_row).collect()
        })
        .await
    }

    pub async fn list_images(&self, ms_path: &str) -> Result<Vec<ImageRecord>> {
        with_op_timeout("products.list_images", async {
            let rows = sqlx::query(
                "SELECT path, ms_path, beam, noise, pbcor FROM images \
                 WHERE ms_path = ? ORDER BY path ASC",
            )
            .bind(ms_path)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("products.list_images", e))?;
            rows.iter().map(image_from_row).collect()
        })
        .await
    }
}
