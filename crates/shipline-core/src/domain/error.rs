//! Domain-level error taxonomy for Shipline.

use uuid::Uuid;

/// Errors raised while generating a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported language: {0:?}")]
    UnsupportedLanguage(String),
}

/// Why a stage attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage {stage} timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("stage {stage} command `{command}` exited with code {exit_code}")]
    CommandFailed {
        stage: String,
        command: String,
        exit_code: i32,
    },

    #[error("stage {stage} reported a security violation: {detail}")]
    SecurityViolation { stage: String, detail: String },

    #[error("stage {stage} could not start `{command}`: {reason}")]
    Spawn {
        stage: String,
        command: String,
        reason: String,
    },

    #[error("stage {stage} has no commands")]
    EmptyCommandList { stage: String },
}

impl StageError {
    /// Whether another attempt may change the outcome.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::CommandFailed { .. })
    }
}

/// Errors surfaced by a source control provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceControlError {
    #[error("source control provider unavailable: {0}")]
    Transient(String),

    #[error("source control provider rejected the request: {0}")]
    Rejected(String),

    #[error("source control object not found: {0}")]
    NotFound(String),
}

impl SourceControlError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised by the pipeline orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("pipeline execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("pipeline execution {0} is no longer running")]
    NotRunning(Uuid),

    #[error("actor {actor} may not {action}")]
    InsufficientPermission { actor: String, action: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] crate::ports::StorageError),

    #[error("pipeline execution {execution_id} aborted: {reason}")]
    Aborted { execution_id: Uuid, reason: String },
}

/// Umbrella error for callers that drive several components.
#[derive(Debug, thiserror::Error)]
pub enum ShiplineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Deploy(#[from] crate::deploy::DeployError),

    #[error(transparent)]
    Monitor(#[from] crate::deploy::MonitorError),

    #[error(transparent)]
    Rollback(#[from] crate::deploy::RollbackError),

    #[error(transparent)]
    SourceControl(#[from] SourceControlError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for Shipline operations.
pub type Result<T> = std::result::Result<T, ShiplineError>;
