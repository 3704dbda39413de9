//! Built-in pipeline stages: conversion, calibration solve and apply,
//! imaging, and product registration.
//!
//! Each stage wraps one collaborator interface, records its bookkeeping
//! in the durable stores, and returns every produced artifact path
//! through the context outputs — downstream stages and auditors never
//! have to discover artifacts on disk.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cal::{CalKind, CaltableEntry, CaltableStatus};
use crate::config::{PipelineConfig, WorkflowPolicy};
use crate::error::{PipelineError, Result};
use crate::stage::{Context, Readiness, Stage, Value, ValueMap};
use crate::store::{ImageRecord, MsRecord, MsStage};
use crate::workflow::{StageSpec, Workflow};

pub mod collab;
pub mod helpers;

pub use collab::{CalApplier, CalSolver, Converter, ImageArtifact, Imager, SolvedTable};
pub use helpers::{
    HelperCalApplier, HelperCalSolver, HelperCommand, HelperConverter, HelperImager,
};

/// Collaborator bundle for the standard workflows.
#[derive(Clone)]
pub struct ScienceDeps {
    pub converter: Arc<dyn Converter>,
    pub solver: Arc<dyn CalSolver>,
    pub applier: Arc<dyn CalApplier>,
    pub imager: Arc<dyn Imager>,
}

impl std::fmt::Debug for ScienceDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScienceDeps")
    }
}

/// Convert a group's sub-band files into a measurement set and index it.
pub struct ConvertStage {
    converter: Arc<dyn Converter>,
    writer: String,
    workers: usize,
}

impl ConvertStage {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self {
            converter,
            writer: "ms-writer".to_string(),
            workers: 4,
        }
    }

    pub fn with_writer(mut self, writer: impl Into<String>, workers: usize) -> Self {
        self.writer = writer.into();
        self.workers = workers.max(1);
        self
    }
}

impl std::fmt::Debug for ConvertStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertStage")
            .field("writer", &self.writer)
            .field("workers", &self.workers)
            .finish()
    }
}

#[async_trait]
impl Stage for ConvertStage {
    fn name(&self) -> &str {
        "convert"
    }

    async fn validate(&self, ctx: &Context) -> Result<Readiness> {
        if ctx.value("group_id").is_none() {
            return Ok(Readiness::not_ready("no group_id in context"));
        }
        if ctx.value("start_mjd").is_none() || ctx.value("end_mjd").is_none() {
            return Ok(Readiness::not_ready(
                "observation epoch unknown for this group",
            ));
        }
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let start_mjd = ctx.require_float("start_mjd")?;
        let end_mjd = ctx.require_float("end_mjd")?;
        let input_dir = ctx.config().paths.input_dir.clone();
        let output_dir = ctx
            .config()
            .paths
            .output_dir
            .join(&ctx.config().paths.science_subdir);
        tokio::fs::create_dir_all(&output_dir).await?;

        let ms_path = self
            .converter
            .convert(
                &input_dir,
                &output_dir,
                start_mjd,
                end_mjd,
                &self.writer,
                self.workers,
            )
            .await?;

        let mid_mjd = (start_mjd + end_mjd) / 2.0;
        let record = MsRecord {
            path: ms_path.to_string_lossy().into_owned(),
            start_mjd,
            mid_mjd,
            end_mjd,
            stage: MsStage::Converted,
            cal_applied: false,
        };
        ctx.stores()?.products.upsert_ms_index(&record).await?;

        Ok(ctx
            .with_output("ms_path", ms_path.as_path())
            .with_output("mid_mjd", mid_mjd))
    }
}

/// Solve calibration tables from a calibrator measurement set and
/// register them with a validity window centred on the observation.
pub struct SolveStage {
    solver: Arc<dyn CalSolver>,
    kinds: Vec<CalKind>,
    params: ValueMap,
    validity_days: f64,
}

impl SolveStage {
    pub fn new(solver: Arc<dyn CalSolver>) -> Self {
        Self {
            solver,
            kinds: CalKind::ALL.to_vec(),
            params: ValueMap::new(),
            validity_days: 1.0,
        }
    }

    pub fn with_kinds(mut self, kinds: Vec<CalKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_validity_days(mut self, days: f64) -> Self {
        self.validity_days = days.max(f64::MIN_POSITIVE);
        self
    }
}

impl std::fmt::Debug for SolveStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveStage")
            .field("kinds", &self.kinds)
            .field("validity_days", &self.validity_days)
            .finish()
    }
}

#[async_trait]
impl Stage for SolveStage {
    fn name(&self) -> &str {
        "solve"
    }

    async fn validate(&self, ctx: &Context) -> Result<Readiness> {
        if ctx.value("ms_path").is_none() {
            return Ok(Readiness::not_ready("no measurement set to solve against"));
        }
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let ms_path = ctx.require_path("ms_path")?.to_path_buf();
        let mid_mjd = ctx.require_float("mid_mjd")?;
        let half_window = self.validity_days / 2.0;

        let mut registered: Vec<Value> = Vec::with_capacity(self.kinds.len());
        for kind in &self.kinds {
            let solved = self.solver.solve(&ms_path, *kind, &self.params).await?;
            let entry = CaltableEntry {
                caltable_id: format!("{kind}-{mid_mjd:.5}"),
                kind: *kind,
                path: solved.path.to_string_lossy().into_owned(),
                valid_from_mjd: mid_mjd - half_window,
                valid_to_mjd: mid_mjd + half_window,
                status: CaltableStatus::Active,
                apply_order: solved.apply_order,
            };
            ctx.stores()?.registry.register_caltable(&entry).await?;
            registered.push(Value::from(entry.caltable_id));
        }

        Ok(ctx.with_output("caltables", Value::List(registered)))
    }
}

/// Apply the active calibration tables valid at the observation epoch.
pub struct ApplyCalStage {
    applier: Arc<dyn CalApplier>,
}

impl ApplyCalStage {
    pub fn new(applier: Arc<dyn CalApplier>) -> Self {
        Self { applier }
    }
}

impl std::fmt::Debug for ApplyCalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApplyCalStage")
    }
}

#[async_trait]
impl Stage for ApplyCalStage {
    fn name(&self) -> &str {
        "apply"
    }

    async fn validate(&self, ctx: &Context) -> Result<Readiness> {
        let Some(mid_mjd) = ctx.value("mid_mjd").and_then(Value::as_float) else {
            return Ok(Readiness::not_ready("no measurement set epoch in context"));
        };
        let applylist = ctx.stores()?.registry.active_applylist(mid_mjd).await?;
        if applylist.is_empty() {
            return Ok(Readiness::not_ready(format!(
                "no active calibration covers mjd {mid_mjd:.5}"
            )));
        }
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let ms_path = ctx.require_path("ms_path")?.to_path_buf();
        let mid_mjd = ctx.require_float("mid_mjd")?;
        let applylist = ctx.stores()?.registry.active_applylist(mid_mjd).await?;

        let calibrated = self.applier.apply(&ms_path, &applylist).await?;

        let record = MsRecord {
            path: calibrated.to_string_lossy().into_owned(),
            start_mjd: ctx.require_float("start_mjd")?,
            mid_mjd,
            end_mjd: ctx.require_float("end_mjd")?,
            stage: MsStage::Calibrated,
            cal_applied: true,
        };
        ctx.stores()?.products.upsert_ms_index(&record).await?;

        Ok(ctx
            .with_output("ms_path", calibrated.as_path())
            .with_output("applied_tables", applylist.len() as i64))
    }
}

/// Image the calibrated measurement set.
pub struct ImageStage {
    imager: Arc<dyn Imager>,
    params: ValueMap,
}

impl ImageStage {
    pub fn new(imager: Arc<dyn Imager>) -> Self {
        Self {
            imager,
            params: ValueMap::new(),
        }
    }

    pub fn with_params(mut self, params: ValueMap) -> Self {
        self.params = params;
        self
    }
}

impl std::fmt::Debug for ImageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ImageStage")
    }
}

#[async_trait]
impl Stage for ImageStage {
    fn name(&self) -> &str {
        "image"
    }

    async fn validate(&self, ctx: &Context) -> Result<Readiness> {
        if ctx.value("ms_path").is_none() {
            return Ok(Readiness::not_ready("no measurement set to image"));
        }
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let ms_path = ctx.require_path("ms_path")?.to_path_buf();
        let artifact = self.imager.image(&ms_path, &self.params).await?;
        Ok(ctx
            .with_output("image_path", artifact.path.as_path())
            .with_output("beam", artifact.beam)
            .with_output("noise", artifact.noise)
            .with_output("pbcor", artifact.pbcor))
    }
}

/// Register the finished products: the image row and the measurement
/// set's final stage advance.
#[derive(Debug, Default)]
pub struct RegisterStage;

#[async_trait]
impl Stage for RegisterStage {
    fn name(&self) -> &str {
        "register"
    }

    async fn validate(&self, ctx: &Context) -> Result<Readiness> {
        if ctx.value("image_path").is_none() || ctx.value("ms_path").is_none() {
            return Ok(Readiness::not_ready("no imaging products to register"));
        }
        Ok(Readiness::Ready)
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let ms_path = ctx.require_path("ms_path")?.to_string_lossy().into_owned();
        let image_path = ctx
            .require_path("image_path")?
            .to_string_lossy()
            .into_owned();
        let stores = ctx.stores()?;

        let ms = match stores.products.get_ms(&ms_path).await {
            Ok(ms) => MsRecord {
                stage: MsStage::Imaged,
                ..ms
            },
            // Conversion may have run out of process and reported the
            // measurement set only through context outputs; index it here.
            Err(PipelineError::NotFound(_)) => {
                let start_mjd = ctx.require_float("start_mjd")?;
                let end_mjd = ctx.require_float("end_mjd")?;
                let mid_mjd = ctx
                    .value("mid_mjd")
                    .and_then(Value::as_float)
                    .unwrap_or((start_mjd + end_mjd) / 2.0);
                MsRecord {
                    path: ms_path.clone(),
                    start_mjd,
                    mid_mjd,
                    end_mjd,
                    stage: MsStage::Imaged,
                    cal_applied: ctx
                        .value("cal_applied")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            }
            Err(e) => return Err(e),
        };
        stores.products.upsert_ms_index(&ms).await?;

        let image = ImageRecord {
            path: image_path,
            ms_path,
            beam: ctx.require_float("beam")?,
            noise: ctx.require_float("noise")?,
            pbcor: ctx.value("pbcor").and_then(Value::as_bool).unwrap_or(false),
        };
        stores.products.insert_image(&image).await?;

        Ok(ctx.with_output("registered", true))
    }
}

/// The standard science workflow: convert, apply calibration, image,
/// register. Every stage is guarded by a breaker named after it.
pub fn imaging_workflow(deps: &ScienceDeps, config: &PipelineConfig) -> Workflow {
    Workflow::new("imaging")
        .policy(config.orchestrator.workflow_policy)
        .parallel(config.orchestrator.parallel_stages)
        .stage(StageSpec::new(Arc::new(ConvertStage::new(deps.converter.clone()))).breaker("convert"))
        .stage(
            StageSpec::new(Arc::new(ApplyCalStage::new(deps.applier.clone())))
                .after(["convert"])
                .breaker("apply"),
        )
        .stage(
            StageSpec::new(Arc::new(ImageStage::new(deps.imager.clone())))
                .after(["apply"])
                .breaker("image"),
        )
        .stage(StageSpec::new(Arc::new(RegisterStage)).after(["image"]))
}

/// The calibrator workflow: convert the calibrator group, then solve and
/// register fresh tables.
pub fn calibrator_workflow(deps: &ScienceDeps, config: &PipelineConfig) -> Workflow {
    Workflow::new("calibration")
        .policy(WorkflowPolicy::StopOnFirstFailure)
        .parallel(false)
        .stage(StageSpec::new(Arc::new(ConvertStage::new(deps.converter.clone()))).breaker("convert"))
        .stage(
            StageSpec::new(Arc::new(SolveStage::new(deps.solver.clone())))
                .after(["convert"])
                .breaker("solve"),
        )
        .stage(StageSpec::new(Arc::new(RegisterCalOnly)).after(["solve"]))
}

/// Terminal bookkeeping for the calibrator workflow; nothing to image, so
/// only the context summary is emitted.
#[derive(Debug, Default)]
struct RegisterCalOnly;

#[async_trait]
impl Stage for RegisterCalOnly {
    fn name(&self) -> &str {
        "register"
    }

    async fn execute(&self, ctx: &Context) -> Result<Context> {
        let solved = ctx
            .value("caltables")
            .and_then(Value::as_list)
            .map(<[Value]>::len)
            .unwrap_or(0);
        Ok(ctx.with_output("registered", solved as i64))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::collab::MockImager;
    use super::*;
    use crate::workflow::dag::topological_order;

    #[tokio::test]
    async fn image_stage_reports_artifact_through_outputs() {
        let mut imager = MockImager::new();
        imager.expect_image().returning(|_, _| {
            Ok(ImageArtifact {
                path: PathBuf::from("/products/science/a.fits"),
                beam: 12.5,
                noise: 0.002,
                pbcor: true,
            })
        });
        let stage = ImageStage::new(Arc::new(imager));
        let ctx = Context::new(Arc::new(PipelineConfig::default()))
            .with_input("ms_path", PathBuf::from("/products/science/a.ms"));

        let out = stage.execute(&ctx).await.unwrap();
        assert_eq!(
            out.require_path("image_path").unwrap(),
            PathBuf::from("/products/science/a.fits").as_path()
        );
        assert_eq!(out.require_float("noise").unwrap(), 0.002);
    }

    #[tokio::test]
    async fn image_stage_requires_a_measurement_set() {
        let stage = ImageStage::new(Arc::new(MockImager::new()));
        let ctx = Context::new(Arc::new(PipelineConfig::default()));
        assert!(matches!(
            stage.validate(&ctx).await.unwrap(),
            Readiness::NotReady(_)
        ));
    }

    #[test]
    fn imaging_workflow_orders_convert_first() {
        let deps = ScienceDeps {
            converter: Arc::new(super::collab::MockConverter::new()),
            solver: Arc::new(super::collab::MockCalSolver::new()),
            applier: Arc::new(super::collab::MockCalApplier::new()),
            imager: Arc::new(MockImager::new()),
        };
        let workflow = imaging_workflow(&deps, &PipelineConfig::default());
        let order = topological_order(&workflow.stages).unwrap();
        let names: Vec<&str> = order
            .into_iter()
            .map(|i| workflow.stages[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["convert", "apply", "image", "register"]);
    }
}
