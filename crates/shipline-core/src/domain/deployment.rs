//! Deployment requests and their approval lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::Actor;

/// Lifecycle of a deployment request.
///
/// ```text
/// pending_approval ──approve──▶ approved ──▶ executing ──▶ success ──▶ rolled_back
///        │                                        │
///        └──reject──▶ rejected                    └──▶ failed
/// ```
/// Requests into environments without an approval gate start at `executing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    PendingApproval,
    Approved,
    Rejected,
    Executing,
    Success,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether the request no longer changes on its own.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Success | Self::Failed | Self::RolledBack
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to deploy a version into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    pub project_id: String,
    pub environment: String,
    pub version: String,
    pub requested_by: Actor,
    pub reason: String,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<Actor>,
    pub rejection_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
    /// Pipeline execution that requested this deployment, if any.
    pub execution_id: Option<Uuid>,
    /// Pipeline configuration the requesting execution ran against.
    pub configuration_id: Option<Uuid>,
}

impl DeploymentRequest {
    pub fn new(
        project_id: impl Into<String>,
        environment: impl Into<String>,
        version: impl Into<String>,
        reason: impl Into<String>,
        requested_by: Actor,
        status: DeploymentStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            environment: environment.into(),
            version: version.into(),
            requested_by,
            reason: reason.into(),
            status,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            rejection_reason: None,
            completed_at: None,
            output: String::new(),
            error: None,
            execution_id: None,
            configuration_id: None,
        }
    }
}
