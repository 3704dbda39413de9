//! Group assembly, claiming, and housekeeping against a real queue store.

mod support;

use std::time::Duration;

use fringe_core::config::IngestConfig;
use fringe_core::error::PipelineError;
use fringe_core::ingest::Ingestor;
use fringe_core::store::{GroupFilter, GroupState};

use support::open_stores;

#[tokio::test]
async fn group_assembly_follows_the_spec_sequence() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;

    // expected_count = 3, arrivals (g,0), (g,2), (g,0) again, (g,1).
    let outcome = queue
        .record_file_arrival("g", 0, "/in/g_sb00.hdf5", 3)
        .await
        .unwrap();
    assert_eq!(outcome.state, GroupState::Collecting);
    assert_eq!(outcome.file_count, 1);

    let outcome = queue
        .record_file_arrival("g", 2, "/in/g_sb02.hdf5", 3)
        .await
        .unwrap();
    assert_eq!(outcome.state, GroupState::Collecting);
    assert_eq!(outcome.file_count, 2);

    // Re-arrival of sub-band 0: path refreshed, nothing advances.
    let outcome = queue
        .record_file_arrival("g", 0, "/in/retry/g_sb00.hdf5", 3)
        .await
        .unwrap();
    assert!(outcome.duplicate);
    assert_eq!(outcome.state, GroupState::Collecting);
    assert_eq!(outcome.file_count, 2);

    let outcome = queue
        .record_file_arrival("g", 1, "/in/g_sb01.hdf5", 3)
        .await
        .unwrap();
    assert!(outcome.promoted);
    assert_eq!(outcome.state, GroupState::Pending);
    assert_eq!(outcome.file_count, 3);

    let snapshot = queue.get_group("g").await.unwrap();
    assert_eq!(snapshot.files.len(), 3);
    assert_eq!(snapshot.files[0].path, "/in/retry/g_sb00.hdf5");
}

#[tokio::test]
async fn duplicate_arrivals_after_promotion_do_not_regress_state() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();
    let snapshot = queue.get_group("g").await.unwrap();
    assert_eq!(snapshot.group.state, GroupState::Pending);

    let outcome = queue.record_file_arrival("g", 0, "/in/b", 1).await.unwrap();
    assert!(outcome.duplicate);
    assert_eq!(outcome.state, GroupState::Pending);
}

#[tokio::test]
async fn zero_expected_count_promotes_on_creation() {
    let (stores, _dir) = open_stores().await;
    let row = stores.queue.upsert_group("empty", 0).await.unwrap();
    assert_eq!(row.state, GroupState::Pending);
}

#[tokio::test]
async fn claim_takes_oldest_pending_and_stamps_attempts() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g1", 0, "/in/g1", 1).await.unwrap();
    queue.record_file_arrival("g2", 0, "/in/g2", 1).await.unwrap();

    let claim = queue.claim_next_pending().await.unwrap().expect("a claim");
    assert_eq!(claim.group.group_id, "g1");
    assert_eq!(claim.group.state, GroupState::InProgress);
    assert_eq!(claim.group.attempt_count, 1);
    assert_eq!(claim.files.len(), 1);

    let claim = queue.claim_next_pending().await.unwrap().expect("a claim");
    assert_eq!(claim.group.group_id, "g2");

    // Queue drained.
    assert!(queue.claim_next_pending().await.unwrap().is_none());
}

#[tokio::test]
async fn claims_only_come_from_pending() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 2).await.unwrap();
    // Still collecting: nothing to claim.
    assert!(queue.claim_next_pending().await.unwrap().is_none());
}

#[tokio::test]
async fn stalled_groups_requeue_until_the_attempt_budget_runs_out() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();
    queue.claim_next_pending().await.unwrap().expect("claimed");

    // Immediately stale (zero heartbeat window), budget of two attempts.
    let outcome = queue
        .requeue_stalled(Duration::ZERO, 2)
        .await
        .unwrap();
    assert_eq!(outcome.requeued, 1);
    assert_eq!(outcome.failed, 0);

    let claim = queue.claim_next_pending().await.unwrap().expect("re-claimed");
    assert_eq!(claim.group.attempt_count, 2);

    // Budget exhausted: the next sweep fails the group.
    let outcome = queue.requeue_stalled(Duration::ZERO, 2).await.unwrap();
    assert_eq!(outcome.requeued, 0);
    assert_eq!(outcome.failed, 1);
    let snapshot = queue.get_group("g").await.unwrap();
    assert_eq!(snapshot.group.state, GroupState::Failed);
}

#[tokio::test]
async fn single_attempt_budget_never_requeues() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();
    queue.claim_next_pending().await.unwrap().expect("claimed");

    let outcome = queue.requeue_stalled(Duration::ZERO, 1).await.unwrap();
    assert_eq!(outcome.requeued, 0);
    assert_eq!(outcome.failed, 1);
}

#[tokio::test]
async fn heartbeat_keeps_a_group_off_the_stalled_sweep() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();
    queue.claim_next_pending().await.unwrap().expect("claimed");
    queue.heartbeat("g").await.unwrap();

    let outcome = queue
        .requeue_stalled(Duration::from_secs(3_600), 3)
        .await
        .unwrap();
    assert_eq!(outcome.requeued, 0);
    assert_eq!(outcome.failed, 0);
}

#[tokio::test]
async fn idle_collecting_groups_expire_to_failed() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 4).await.unwrap();

    assert_eq!(queue.expire_collecting(Duration::ZERO).await.unwrap(), 1);
    let snapshot = queue.get_group("g").await.unwrap();
    assert_eq!(snapshot.group.state, GroupState::Failed);

    // Files survive their group.
    assert_eq!(snapshot.files.len(), 1);
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();

    // pending -> completed is not a legal edge (claim is the only way
    // forward).
    let err = queue
        .mark_group("g", GroupState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));

    queue.claim_next_pending().await.unwrap().expect("claimed");
    queue.mark_group("g", GroupState::Completed).await.unwrap();

    // Terminal states are sticky.
    let err = queue
        .mark_group("g", GroupState::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConstraintViolation(_)));

    // Marking the current state again is a no-op.
    queue.mark_group("g", GroupState::Completed).await.unwrap();
}

#[tokio::test]
async fn explicit_requeue_from_in_progress_is_allowed() {
    let (stores, _dir) = open_stores().await;
    let queue = &stores.queue;
    queue.record_file_arrival("g", 0, "/in/a", 1).await.unwrap();
    queue.claim_next_pending().await.unwrap().expect("claimed");
    queue.mark_group("g", GroupState::Pending).await.unwrap();
    let listed = queue
        .list_groups(GroupFilter {
            state: Some(GroupState::Pending),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn ingestor_applies_the_filename_convention() {
    let (stores, _dir) = open_stores().await;
    let config = IngestConfig {
        expected_subbands: 2,
        ..IngestConfig::default()
    };
    let ingestor = Ingestor::new(stores.queue.clone(), &config).unwrap();

    let ignored = ingestor
        .observe_file(std::path::Path::new("/in/README.txt"))
        .await
        .unwrap();
    assert!(ignored.is_none());

    let outcome = ingestor
        .observe_file(std::path::Path::new("/in/2024-02-25T12:00:00_sb00.hdf5"))
        .await
        .unwrap()
        .expect("matching file recorded");
    assert_eq!(outcome.group_id, "2024-02-25T12:00:00");
    assert_eq!(outcome.state, GroupState::Collecting);

    let outcome = ingestor
        .observe_file(std::path::Path::new("/in/2024-02-25T12:00:00_sb01.hdf5"))
        .await
        .unwrap()
        .expect("matching file recorded");
    assert!(outcome.promoted);
    assert_eq!(outcome.state, GroupState::Pending);
}
