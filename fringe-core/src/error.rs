use thiserror::Error;

/// Error taxonomy for the pipeline control plane.
///
/// Repository failures are classified at the store boundary (see
/// `store::classify`); everything else is produced by the component that
/// detects the condition. `is_retryable` encodes the default retry
/// predicate used by the orchestrator.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid workflow: {0}")]
    WorkflowInvalid(String),

    #[error("stage {stage} prerequisite not met: {reason}")]
    PrerequisiteNotMet { stage: String, reason: String },

    #[error("stage {stage} timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("stage failure: {0}")]
    Fatal(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("calibration registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Default retry classification: store unavailability, attempt
    /// timeouts, and explicitly transient failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::StageTimeout { .. } | Self::Transient(_)
        )
    }

    /// Short machine-readable tag recorded in job rows and DLQ items.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowInvalid(_) => "workflow_invalid",
            Self::PrerequisiteNotMet { .. } => "prerequisite_not_met",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::Conflict(_) => "conflict",
            Self::RegistryCorrupt(_) => "registry_corrupt",
            Self::Cancelled(_) => "cancelled",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
