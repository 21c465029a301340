//! Error types for deployment gating, health monitoring and rollback.

use uuid::Uuid;

use crate::ports::StorageError;

/// Errors produced by the deployment trigger.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("environment {environment} is not defined for project {project_id}")]
    EnvironmentNotFound {
        project_id: String,
        environment: String,
    },

    #[error("deployment request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("actor {actor} may not {action}")]
    InsufficientPermission { actor: String, action: String },

    #[error("deployment request {id} was already decided ({status})")]
    AlreadyDecided { id: Uuid, status: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for deployment trigger operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Errors produced by the deployment monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("health session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("health session {0} is closed")]
    SessionClosed(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for monitor operations.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Errors produced by the rollback controller.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("invalid rollback target: {0}")]
    InvalidTarget(String),

    #[error("actor {actor} may not roll back {environment}")]
    InsufficientPermission { actor: String, environment: String },

    #[error("rollback failed at step {step}: {reason}")]
    RollbackFailed { step: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
