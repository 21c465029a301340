//! Collaborator interfaces consumed by Shipline components.
//!
//! These traits define the narrow seams to everything outside the
//! orchestration core:
//! - `AuditRecorder`: fire-and-forget audit log
//! - `EventBus`: at-most-once broadcast of typed events
//! - `SourceControlProvider`: branch/commit/PR/issue capability
//! - `ProjectStore`: read-only project metadata
//! - `EnvironmentCatalog`: environment and deployment policy lookup
//! - `ExecutionHistory`: append-only pipeline execution history
//! - `SnapshotStore`: rollback targets
//! - `DeploymentExecutor`: performs deployment steps
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AuditEntry, DeploymentPolicy, DeploymentRequest, EnvironmentDefinition, PipelineEvent,
    PipelineExecution, PipelineSettings, Platform, Snapshot, SourceControlError,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by storage-backed collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Observability collaborators
// ---------------------------------------------------------------------------

/// Audit log sink. Recording never blocks or fails the caller.
pub trait AuditRecorder: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Event broadcaster. Delivery is at-most-once.
pub trait EventBus: Send + Sync {
    fn broadcast(&self, event: PipelineEvent);
}

// ---------------------------------------------------------------------------
// SourceControlProvider
// ---------------------------------------------------------------------------

/// Issue as reported by a source control provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub open: bool,
}

/// Capability interface over a git hosting provider.
#[async_trait]
pub trait SourceControlProvider: Send + Sync {
    /// Create `branch` pointing at `from_commit`. Returns the new ref.
    async fn create_branch(
        &self,
        project_id: &str,
        branch: &str,
        from_commit: &str,
    ) -> Result<String, SourceControlError>;

    /// Commit `files` (path → contents) onto `branch`. Returns the commit id.
    async fn create_commit(
        &self,
        project_id: &str,
        branch: &str,
        message: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<String, SourceControlError>;

    /// Open a pull request. Returns its number.
    async fn create_pull_request(
        &self,
        project_id: &str,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<u64, SourceControlError>;

    /// File an issue. Returns its number.
    async fn create_issue(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<u64, SourceControlError>;

    async fn get_issues(&self, project_id: &str, open_only: bool)
        -> Result<Vec<Issue>, SourceControlError>;
}

// ---------------------------------------------------------------------------
// Project and environment lookups
// ---------------------------------------------------------------------------

/// Project metadata used to generate a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectProfile {
    pub project_id: String,
    pub language: String,
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub settings: PipelineSettings,
}

/// Read-only project metadata store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn project(&self, project_id: &str) -> StorageResult<Option<ProjectProfile>>;
}

/// Environment definitions and deployment policy per project.
#[async_trait]
pub trait EnvironmentCatalog: Send + Sync {
    async fn environment(
        &self,
        project_id: &str,
        name: &str,
    ) -> StorageResult<Option<EnvironmentDefinition>>;

    async fn deployment_policy(&self, project_id: &str) -> StorageResult<Option<DeploymentPolicy>>;
}

// ---------------------------------------------------------------------------
// ExecutionHistory
// ---------------------------------------------------------------------------

/// Per-project pipeline execution history.
///
/// Guarantees:
/// - Executions are listed in the order they were appended.
/// - `update` replaces an existing execution; it never adds one.
/// - Readers may run concurrently with the single writer of an execution.
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    async fn append(&self, execution: &PipelineExecution) -> StorageResult<()>;

    async fn update(&self, execution: &PipelineExecution) -> StorageResult<()>;

    async fn get(&self, execution_id: Uuid) -> StorageResult<PipelineExecution>;

    async fn list(&self, project_id: &str) -> StorageResult<Vec<PipelineExecution>>;
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> StorageResult<()>;

    async fn get(&self, snapshot_id: Uuid) -> StorageResult<Option<Snapshot>>;

    /// Most recently captured verified snapshot for an environment.
    async fn latest_verified(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StorageResult<Option<Snapshot>>;

    /// Snapshot produced by a given deployment, if any.
    async fn for_deployment(&self, deployment_id: Uuid) -> StorageResult<Option<Snapshot>>;

    async fn mark_verified(&self, snapshot_id: Uuid) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// DeploymentExecutor
// ---------------------------------------------------------------------------

/// Performs the concrete deployment steps.
#[async_trait]
pub trait DeploymentExecutor: Send + Sync {
    /// Deploy `request.version` into `request.environment`. Returns captured output.
    async fn deploy(&self, request: &DeploymentRequest) -> anyhow::Result<String>;

    /// Redeploy a snapshot's commit during rollback.
    async fn redeploy(&self, snapshot: &Snapshot) -> anyhow::Result<String>;
}
