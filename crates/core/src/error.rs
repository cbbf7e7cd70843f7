use crate::types::ExperimentStatus;
use thiserror::Error;
use uuid::Uuid;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(Uuid),

    #[error("Experiment {id} is not running (status: {status})")]
    ExperimentNotRunning { id: Uuid, status: ExperimentStatus },

    #[error("Assignment not found: {0}")]
    AssignmentNotFound(Uuid),

    #[error("Invalid variant configuration: {0}")]
    InvalidVariantConfiguration(String),

    #[error("Invalid experiment configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("Concurrent modification of experiment {0}")]
    Conflict(Uuid),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExperimentError {
    /// Stable machine-readable code for transport bindings.
    pub fn code(&self) -> &'static str {
        match self {
            ExperimentError::ExperimentNotFound(_) => "experiment_not_found",
            ExperimentError::ExperimentNotRunning { .. } => "experiment_not_running",
            ExperimentError::AssignmentNotFound(_) => "assignment_not_found",
            ExperimentError::InvalidVariantConfiguration(_) => "invalid_variant_configuration",
            ExperimentError::InvalidConfiguration(_) => "invalid_configuration",
            ExperimentError::InvalidStateTransition { .. } => "invalid_state_transition",
            ExperimentError::Conflict(_) => "conflict",
            ExperimentError::CollaboratorUnavailable(_) => "collaborator_unavailable",
            ExperimentError::UnknownOperation(_) => "unknown_operation",
            ExperimentError::Serialization(_) => "serialization_error",
        }
    }
}

/// Failures raised by storage collaborator implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ExperimentError {
    fn from(err: StoreError) -> Self {
        ExperimentError::CollaboratorUnavailable(err.to_string())
    }
}
