//! End-to-end pipeline behaviour: the built-in science stages over fake
//! collaborators, and the group processing loop.

mod support;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fringe_core::cal::{datetime_to_mjd, CalKind, CaltableEntry, CaltableRef, CaltableStatus};
use fringe_core::config::PipelineConfig;
use fringe_core::error::Result;
use fringe_core::runner::{GroupProcessor, JobRunner, WorkflowRegistry};
use fringe_core::stage::{Context, Stage, Value, ValueMap};
use fringe_core::stages::{
    calibrator_workflow, imaging_workflow, CalApplier, CalSolver, Converter, ImageArtifact,
    Imager, RegisterStage, ScienceDeps, SolvedTable,
};
use fringe_core::store::{GroupState, JobStatus, MsStage, StoreSet};
use fringe_core::workflow::{Orchestrator, StageStatus, WorkflowStatus};

use support::open_stores;

struct FakeConverter;

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(
        &self,
        _input_dir: &Path,
        output_dir: &Path,
        _start_mjd: f64,
        _end_mjd: f64,
        _writer: &str,
        _workers: usize,
    ) -> Result<PathBuf> {
        Ok(output_dir.join("obs.ms"))
    }
}

struct FakeSolver;

#[async_trait]
impl CalSolver for FakeSolver {
    async fn solve(
        &self,
        _ms_path: &Path,
        kind: CalKind,
        _params: &ValueMap,
    ) -> Result<SolvedTable> {
        Ok(SolvedTable {
            path: PathBuf::from(format!("/cal/{kind}.table")),
            apply_order: 0,
        })
    }
}

#[derive(Default)]
struct FakeApplier {
    seen: Arc<Mutex<Vec<CaltableRef>>>,
}

#[async_trait]
impl CalApplier for FakeApplier {
    async fn apply(&self, ms_path: &Path, tables: &[CaltableRef]) -> Result<PathBuf> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.extend(tables.iter().cloned());
        }
        // In-place annotation: the calibrated set keeps its path.
        Ok(ms_path.to_path_buf())
    }
}

struct FakeImager;

#[async_trait]
impl Imager for FakeImager {
    async fn image(&self, ms_path: &Path, _params: &ValueMap) -> Result<ImageArtifact> {
        Ok(ImageArtifact {
            path: ms_path.with_extension("fits"),
            beam: 10.0,
            noise: 0.001,
            pbcor: false,
        })
    }
}

fn test_config(dir: &Path) -> Arc<PipelineConfig> {
    let mut config = PipelineConfig::default();
    config.paths.input_dir = dir.join("incoming");
    config.paths.output_dir = dir.join("products");
    config.paths.scratch_dir = dir.join("scratch");
    config.paths.state_dir = dir.join("state");
    Arc::new(config)
}

fn deps(applier: &FakeApplier) -> ScienceDeps {
    ScienceDeps {
        converter: Arc::new(FakeConverter),
        solver: Arc::new(FakeSolver),
        applier: Arc::new(FakeApplier {
            seen: applier.seen.clone(),
        }),
        imager: Arc::new(FakeImager),
    }
}

fn active_table(kind: CalKind, from: f64, to: f64) -> CaltableEntry {
    CaltableEntry {
        caltable_id: format!("{kind}-test"),
        kind,
        path: format!("/cal/{kind}.table"),
        valid_from_mjd: from,
        valid_to_mjd: to,
        status: CaltableStatus::Active,
        apply_order: 0,
    }
}

async fn seed_registry(stores: &StoreSet, kinds: &[CalKind], from: f64, to: f64) {
    for kind in kinds {
        stores
            .registry
            .register_caltable(&active_table(*kind, from, to))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn imaging_workflow_calibrates_images_and_registers() {
    let (stores, dir) = open_stores().await;
    let config = test_config(dir.path());
    seed_registry(
        &stores,
        &[CalKind::BandpassAmp, CalKind::Delay, CalKind::GainPhase],
        59_999.0,
        60_001.0,
    )
    .await;

    let applier = FakeApplier::default();
    let workflow = imaging_workflow(&deps(&applier), &config);
    let ctx = Context::new(config.clone())
        .with_input("group_id", "g")
        .with_input("start_mjd", 60_000.0)
        .with_input("end_mjd", 60_000.02)
        .with_stores(stores.clone());

    let run = Orchestrator::new()
        .with_stores(stores.clone())
        .run(&workflow, ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Completed);

    // The applier saw the fixed kind order.
    let seen: Vec<CalKind> = applier.seen.lock().unwrap().iter().map(|r| r.kind).collect();
    assert_eq!(
        seen,
        vec![CalKind::Delay, CalKind::BandpassAmp, CalKind::GainPhase]
    );

    // Artifacts travelled through the context outputs.
    let ms_path = run.context.value("ms_path").and_then(Value::as_path).unwrap();
    let image_path = run
        .context
        .value("image_path")
        .and_then(Value::as_path)
        .unwrap();
    assert_eq!(image_path, ms_path.with_extension("fits").as_path());

    // Product bookkeeping: the measurement set reached `imaged` with
    // calibration applied, and the image row is attached.
    let ms = stores
        .products
        .get_ms(&ms_path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(ms.stage, MsStage::Imaged);
    assert!(ms.cal_applied);
    let images = stores
        .products
        .list_images(&ms_path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
}

#[tokio::test]
async fn missing_calibration_skips_the_downstream_chain() {
    let (stores, dir) = open_stores().await;
    let config = test_config(dir.path());

    let applier = FakeApplier::default();
    let workflow = imaging_workflow(&deps(&applier), &config);
    let ctx = Context::new(config.clone())
        .with_input("group_id", "g")
        .with_input("start_mjd", 60_000.0)
        .with_input("end_mjd", 60_000.02)
        .with_stores(stores.clone());

    let run = Orchestrator::new()
        .with_stores(stores.clone())
        .run(&workflow, ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.stages["convert"].status, StageStatus::Completed);
    let apply = &run.stages["apply"];
    assert_eq!(apply.status, StageStatus::Skipped);
    assert!(apply
        .skip_reason
        .as_deref()
        .unwrap_or_default()
        .contains("no active calibration"));
    assert_eq!(
        run.stages["image"].skip_reason.as_deref(),
        Some("prerequisite_not_met:apply")
    );
    assert_eq!(
        run.stages["register"].skip_reason.as_deref(),
        Some("prerequisite_not_met:image")
    );
}

#[tokio::test]
async fn calibrator_workflow_registers_a_full_applylist() {
    let (stores, dir) = open_stores().await;
    let config = test_config(dir.path());

    let applier = FakeApplier::default();
    let workflow = calibrator_workflow(&deps(&applier), &config);
    let ctx = Context::new(config.clone())
        .with_input("group_id", "cal-field")
        .with_input("start_mjd", 60_000.0)
        .with_input("end_mjd", 60_000.02)
        .with_stores(stores.clone());

    let run = Orchestrator::new()
        .with_stores(stores.clone())
        .run(&workflow, ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, WorkflowStatus::Completed);

    let solved = run
        .context
        .value("caltables")
        .and_then(Value::as_list)
        .unwrap();
    assert_eq!(solved.len(), CalKind::ALL.len());

    let list = stores.registry.active_applylist(60_000.01).await.unwrap();
    let kinds: Vec<CalKind> = list.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, CalKind::ALL.to_vec());
}

#[tokio::test]
async fn register_stage_indexes_an_unseen_measurement_set() {
    let (stores, dir) = open_stores().await;

    // No prior stage touched the products store: the measurement set is
    // known only through the context, as with out-of-process conversion.
    let ctx = Context::new(test_config(dir.path()))
        .with_input("start_mjd", 60_000.0)
        .with_input("end_mjd", 60_000.02)
        .with_input("ms_path", PathBuf::from("/p/iso.ms"))
        .with_input("image_path", PathBuf::from("/p/iso.fits"))
        .with_input("beam", 9.0)
        .with_input("noise", 0.004)
        .with_input("cal_applied", true)
        .with_stores(stores.clone());

    let out = RegisterStage.execute(&ctx).await.unwrap();
    assert_eq!(out.value("registered"), Some(&Value::from(true)));

    let ms = stores.products.get_ms("/p/iso.ms").await.unwrap();
    assert_eq!(ms.stage, MsStage::Imaged);
    assert!(ms.cal_applied);
    assert!((ms.mid_mjd - 60_000.01).abs() < 1e-9);

    let images = stores.products.list_images("/p/iso.ms").await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].path, "/p/iso.fits");
}

#[tokio::test]
async fn group_processor_drives_a_claimed_group_to_completion() {
    let (stores, dir) = open_stores().await;
    let config = test_config(dir.path());

    // Two sub-bands with a timestamp-keyed group id, as the watcher would
    // record them.
    let group_id = "2024-02-25T12:00:00";
    let epoch = datetime_to_mjd(
        chrono::NaiveDateTime::parse_from_str(group_id, "%Y-%m-%dT%H:%M:%S")
            .unwrap()
            .and_utc(),
    );
    seed_registry(&stores, &[CalKind::Delay], epoch - 0.5, epoch + 0.5).await;
    stores
        .queue
        .record_file_arrival(group_id, 0, "/in/sb00.hdf5", 2)
        .await
        .unwrap();
    stores
        .queue
        .record_file_arrival(group_id, 1, "/in/sb01.hdf5", 2)
        .await
        .unwrap();

    let applier = FakeApplier::default();
    let mut registry = WorkflowRegistry::new();
    registry.register(imaging_workflow(&deps(&applier), &config));
    let runner = JobRunner::new(
        config.clone(),
        stores.clone(),
        Arc::new(registry),
        Arc::new(Orchestrator::new().with_stores(stores.clone())),
    );
    let processor = GroupProcessor::new(runner, stores.queue.clone(), "imaging");

    let claim = stores
        .queue
        .claim_next_pending()
        .await
        .unwrap()
        .expect("group is pending");
    processor
        .process_group(claim, &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = stores.queue.get_group(group_id).await.unwrap();
    assert_eq!(snapshot.group.state, GroupState::Completed);

    let jobs = stores
        .jobs
        .list_jobs(Default::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Done);

    // The job captured per-stage results and produced products.
    let stage_results = jobs[0].stage_results.clone().unwrap();
    assert_eq!(stage_results["register"]["status"], "completed");
}
