//! Core library for the Fringe imaging pipeline.
//!
//! Fringe turns the continuous arrival of sub-band files from a radio
//! interferometer into calibrated images: arrivals are assembled into
//! observation groups, each group is driven through a declarative staged
//! workflow (conversion, calibration, imaging, registration), and every
//! transition is recorded in durable per-store SQLite state. This crate is
//! the control plane; the scientific routines themselves are injected
//! through the collaborator traits in [`stages::collab`].

pub mod cal;
pub mod config;
pub mod error;
pub mod ingest;
pub mod resources;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod store;
pub mod workflow;

pub use cal::{CalKind, CaltableEntry, CaltableRef, CaltableStatus};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use ingest::{IngestHousekeeper, IngestWatcher, Ingestor};
pub use resources::ResourceManager;
pub use runner::{GroupProcessor, JobRunner, WorkflowRegistry};
pub use stage::{Context, Readiness, Stage, StageObserver, Value, ValueMap};
pub use store::StoreSet;
pub use workflow::{Orchestrator, RetryPolicy, StageSpec, Workflow, WorkflowStatus};
