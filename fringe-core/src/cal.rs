//! Calibration domain types: table kinds, versioned entries, and the
//! apply-list ordering rules.
//!
//! Durable storage for these types lives in [`crate::store::registry`];
//! this module owns the pure pieces so the ordering invariants can be
//! tested without a database.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// MJD of the Unix epoch (1970-01-01T00:00:00Z).
pub const MJD_UNIX_EPOCH: f64 = 40_587.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Convert a UTC timestamp to Modified Julian Day.
pub fn datetime_to_mjd(dt: DateTime<Utc>) -> f64 {
    MJD_UNIX_EPOCH + dt.timestamp_millis() as f64 / MILLIS_PER_DAY
}

/// Convert an MJD value back to a UTC timestamp (millisecond resolution).
pub fn mjd_to_datetime(mjd: f64) -> Option<DateTime<Utc>> {
    let millis = ((mjd - MJD_UNIX_EPOCH) * MILLIS_PER_DAY).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Calibration table kinds, declared in their fixed apply order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalKind {
    Delay,
    BandpassAmp,
    BandpassPhase,
    GainAmp,
    GainPhase,
    ShortGain,
    Flux,
}

impl CalKind {
    /// All kinds in apply order.
    pub const ALL: [CalKind; 7] = [
        CalKind::Delay,
        CalKind::BandpassAmp,
        CalKind::BandpassPhase,
        CalKind::GainAmp,
        CalKind::GainPhase,
        CalKind::ShortGain,
        CalKind::Flux,
    ];

    /// Position within the fixed apply order.
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CalKind::Delay => "delay",
            CalKind::BandpassAmp => "bandpass_amp",
            CalKind::BandpassPhase => "bandpass_phase",
            CalKind::GainAmp => "gain_amp",
            CalKind::GainPhase => "gain_phase",
            CalKind::ShortGain => "short_gain",
            CalKind::Flux => "flux",
        }
    }
}

impl fmt::Display for CalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delay" => Ok(CalKind::Delay),
            "bandpass_amp" => Ok(CalKind::BandpassAmp),
            "bandpass_phase" => Ok(CalKind::BandpassPhase),
            "gain_amp" => Ok(CalKind::GainAmp),
            "gain_phase" => Ok(CalKind::GainPhase),
            "short_gain" => Ok(CalKind::ShortGain),
            "flux" => Ok(CalKind::Flux),
            other => Err(PipelineError::RegistryCorrupt(format!(
                "unknown caltable kind `{other}`"
            ))),
        }
    }
}

/// Lifecycle status of a calibration table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaltableStatus {
    Active,
    Retired,
    Failed,
}

impl CaltableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaltableStatus::Active => "active",
            CaltableStatus::Retired => "retired",
            CaltableStatus::Failed => "failed",
        }
    }
}

impl FromStr for CaltableStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CaltableStatus::Active),
            "retired" => Ok(CaltableStatus::Retired),
            "failed" => Ok(CaltableStatus::Failed),
            other => Err(PipelineError::RegistryCorrupt(format!(
                "unknown caltable status `{other}`"
            ))),
        }
    }
}

/// A versioned calibration solution with its validity window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaltableEntry {
    pub caltable_id: String,
    pub kind: CalKind,
    /// Artifact location; opaque to the control plane.
    pub path: String,
    /// Inclusive lower bound of the validity window.
    pub valid_from_mjd: f64,
    /// Exclusive upper bound of the validity window.
    pub valid_to_mjd: f64,
    pub status: CaltableStatus,
    /// Intra-kind ordering when several tables of one kind apply.
    pub apply_order: i32,
}

impl CaltableEntry {
    /// Window sanity check shared by all registry writes.
    pub fn check_window(&self) -> Result<()> {
        if self.valid_to_mjd > self.valid_from_mjd {
            Ok(())
        } else {
            Err(PipelineError::ConstraintViolation(format!(
                "caltable {} has empty validity window [{}, {})",
                self.caltable_id, self.valid_from_mjd, self.valid_to_mjd
            )))
        }
    }

    /// Whether the validity window contains `mjd`.
    pub fn covers(&self, mjd: f64) -> bool {
        self.valid_from_mjd <= mjd && mjd < self.valid_to_mjd
    }

    pub fn to_ref(&self) -> CaltableRef {
        CaltableRef {
            caltable_id: self.caltable_id.clone(),
            kind: self.kind,
            path: self.path.clone(),
            apply_order: self.apply_order,
        }
    }
}

/// Apply-list element handed to the calibration applier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaltableRef {
    pub caltable_id: String,
    pub kind: CalKind,
    pub path: String,
    pub apply_order: i32,
}

/// Order active entries into an apply list.
///
/// Expects the caller to have filtered to entries whose window contains the
/// target MJD. Fails `RegistryCorrupt` when the one-active-window-per-kind
/// invariant is violated. Output is sorted by the fixed kind order, then by
/// `apply_order`.
pub fn order_applylist(mut entries: Vec<CaltableEntry>) -> Result<Vec<CaltableRef>> {
    entries.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then(a.apply_order.cmp(&b.apply_order))
            .then(a.caltable_id.cmp(&b.caltable_id))
    });
    for pair in entries.windows(2) {
        if pair[0].kind == pair[1].kind {
            return Err(PipelineError::RegistryCorrupt(format!(
                "multiple active {} tables cover the same epoch: {} and {}",
                pair[0].kind, pair[0].caltable_id, pair[1].caltable_id
            )));
        }
    }
    Ok(entries.iter().map(CaltableEntry::to_ref).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, kind: CalKind, order: i32) -> CaltableEntry {
        CaltableEntry {
            caltable_id: id.to_string(),
            kind,
            path: format!("/cal/{id}"),
            valid_from_mjd: 59_000.0,
            valid_to_mjd: 61_000.0,
            status: CaltableStatus::Active,
            apply_order: order,
        }
    }

    #[test]
    fn applylist_uses_fixed_kind_order() {
        let list = order_applylist(vec![
            entry("bamp", CalKind::BandpassAmp, 0),
            entry("bphase", CalKind::BandpassPhase, 0),
            entry("delay", CalKind::Delay, 0),
        ])
        .unwrap();
        let kinds: Vec<CalKind> = list.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![CalKind::Delay, CalKind::BandpassAmp, CalKind::BandpassPhase]
        );
    }

    #[test]
    fn duplicate_kind_coverage_is_corrupt() {
        let err = order_applylist(vec![
            entry("g1", CalKind::GainAmp, 0),
            entry("g2", CalKind::GainAmp, 1),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::RegistryCorrupt(_)));
    }

    #[test]
    fn window_bounds_are_inclusive_exclusive() {
        let e = entry("d", CalKind::Delay, 0);
        assert!(e.covers(59_000.0));
        assert!(e.covers(60_999.999));
        assert!(!e.covers(61_000.0));
        assert!(!e.covers(58_999.999));
    }

    #[test]
    fn mjd_round_trip_at_millisecond_resolution() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 25, 12, 0, 0).unwrap();
        let mjd = datetime_to_mjd(dt);
        assert_eq!(mjd_to_datetime(mjd), Some(dt));
    }

    #[test]
    fn kind_rank_matches_declaration_order() {
        for (i, kind) in CalKind::ALL.iter().enumerate() {
            assert_eq!(kind.rank() as usize, i);
            assert_eq!(CalKind::from_str(kind.as_str()).unwrap(), *kind);
        }
    }
}
