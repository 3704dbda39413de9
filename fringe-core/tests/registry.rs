//! Calibration registry behaviour: windows, overlap admission, apply-list
//! ordering, retirement.

mod support;

use fringe_core::cal::{CalKind, CaltableEntry, CaltableStatus};
use fringe_core::error::PipelineError;
use fringe_core::store::RegisterOutcome;

use support::open_stores;

fn entry(id: &str, kind: CalKind, from: f64, to: f64, order: i32) -> CaltableEntry {
    CaltableEntry {
        caltable_id: id.to_string(),
        kind,
        path: format!("/cal/{id}.table"),
        valid_from_mjd: from,
        valid_to_mjd: to,
        status: CaltableStatus::Active,
        apply_order: order,
    }
}

#[tokio::test]
async fn applylist_emits_fixed_kind_order() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;

    for e in [
        entry("bamp", CalKind::BandpassAmp, 59_990.0, 60_010.0, 0),
        entry("bphase", CalKind::BandpassPhase, 59_990.0, 60_010.0, 0),
        entry("delay", CalKind::Delay, 59_990.0, 60_010.0, 0),
    ] {
        registry.register_caltable(&e).await.unwrap();
    }

    let list = registry.active_applylist(60_000.0).await.unwrap();
    let kinds: Vec<CalKind> = list.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![CalKind::Delay, CalKind::BandpassAmp, CalKind::BandpassPhase]
    );
}

#[tokio::test]
async fn applylist_only_returns_entries_covering_the_epoch() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("old", CalKind::Delay, 59_000.0, 59_500.0, 0))
        .await
        .unwrap();
    registry
        .register_caltable(&entry("new", CalKind::Delay, 59_500.0, 60_000.0, 0))
        .await
        .unwrap();

    // Windows are inclusive-exclusive.
    let list = registry.active_applylist(59_500.0).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].caltable_id, "new");
    assert!(registry.active_applylist(60_000.0).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlapping_active_windows_are_rejected() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("a", CalKind::GainAmp, 59_000.0, 60_000.0, 0))
        .await
        .unwrap();

    let err = registry
        .register_caltable(&entry("b", CalKind::GainAmp, 59_999.0, 60_500.0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));

    // A different kind over the same window is fine.
    registry
        .register_caltable(&entry("c", CalKind::GainPhase, 59_999.0, 60_500.0, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn identical_registration_is_a_no_op() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    let e = entry("a", CalKind::Flux, 59_000.0, 60_000.0, 0);
    assert_eq!(
        registry.register_caltable(&e).await.unwrap(),
        RegisterOutcome::Inserted
    );
    assert_eq!(
        registry.register_caltable(&e).await.unwrap(),
        RegisterOutcome::Unchanged
    );

    // Same id with different fields is a conflict, not a silent update.
    let mut changed = e.clone();
    changed.path = "/cal/elsewhere.table".to_string();
    let err = registry.register_caltable(&changed).await.unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));
}

#[tokio::test]
async fn empty_windows_are_rejected() {
    let (stores, _dir) = open_stores().await;
    let err = stores
        .registry
        .register_caltable(&entry("bad", CalKind::Delay, 60_000.0, 60_000.0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));
}

#[tokio::test]
async fn retiring_clears_the_way_for_a_successor() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("v1", CalKind::Delay, 59_000.0, 60_000.0, 0))
        .await
        .unwrap();

    registry.retire_caltable("v1").await.unwrap();
    assert!(registry.active_applylist(59_500.0).await.unwrap().is_empty());
    assert_eq!(
        registry.get_caltable("v1").await.unwrap().status,
        CaltableStatus::Retired
    );

    // Retirement is not repeatable.
    let err = registry.retire_caltable("v1").await.unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));
}

#[tokio::test]
async fn adjacent_windows_coexist_and_retire_independently() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("older", CalKind::Delay, 59_000.0, 60_000.0, 0))
        .await
        .unwrap();
    // Adjacent, non-overlapping window of the same kind is admissible.
    registry
        .register_caltable(&entry("newer", CalKind::Delay, 60_000.0, 61_000.0, 0))
        .await
        .unwrap();
    // Nothing older covers the newer window, so it retires freely.
    registry.retire_caltable("newer").await.unwrap();
    let list = registry.active_applylist(59_500.0).await.unwrap();
    assert_eq!(list[0].caltable_id, "older");
}

#[tokio::test]
async fn replace_retires_and_activates_in_one_step() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("v1", CalKind::BandpassAmp, 59_000.0, 60_000.0, 0))
        .await
        .unwrap();

    // The successor covers the same epoch, which plain registration would
    // reject while v1 is still active.
    let successor = entry("v2", CalKind::BandpassAmp, 59_000.0, 60_000.0, 0);
    registry.replace_caltable("v1", &successor).await.unwrap();

    let list = registry.active_applylist(59_500.0).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].caltable_id, "v2");
    assert_eq!(
        registry.get_caltable("v1").await.unwrap().status,
        CaltableStatus::Retired
    );
}

#[tokio::test]
async fn failed_solutions_drop_out_of_the_applylist() {
    let (stores, _dir) = open_stores().await;
    let registry = &stores.registry;
    registry
        .register_caltable(&entry("sus", CalKind::ShortGain, 59_000.0, 60_000.0, 0))
        .await
        .unwrap();
    registry.mark_failed("sus").await.unwrap();
    assert!(registry.active_applylist(59_500.0).await.unwrap().is_empty());
}
