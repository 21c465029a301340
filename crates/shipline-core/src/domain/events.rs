//! Typed events broadcast to observers and entries handed to the audit recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deployment::DeploymentStatus;
use super::pipeline::{PipelineStatus, StageStatus};
use super::testing::{SuiteStatus, TestExecutionStatus};

/// Broadcast topic names.
pub mod topics {
    pub const STAGE_PROGRESS: &str = "pipeline.stage_progress";
    pub const PIPELINE_STATUS: &str = "pipeline.status";
    pub const TEST_PROGRESS: &str = "tests.progress";
    pub const DEPLOYMENT_STATUS: &str = "deployment.status";
    pub const HEALTH: &str = "deployment.health";
    pub const ROLLBACK: &str = "deployment.rollback";
}

/// Outcome of one rollback step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Every event Shipline broadcasts, one variant per topic family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageProgress {
        execution_id: Uuid,
        project_id: String,
        stage: String,
        index: usize,
        status: StageStatus,
        at: DateTime<Utc>,
    },
    PipelineStatus {
        execution_id: Uuid,
        project_id: String,
        status: PipelineStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    TestProgress {
        test_execution_id: Uuid,
        project_id: String,
        suite: Option<String>,
        suite_status: Option<SuiteStatus>,
        status: TestExecutionStatus,
        at: DateTime<Utc>,
    },
    DeploymentStatus {
        request_id: Uuid,
        project_id: String,
        environment: String,
        version: String,
        status: DeploymentStatus,
        at: DateTime<Utc>,
    },
    HealthAlert {
        session_id: Uuid,
        deployment_id: Uuid,
        environment: String,
        check_id: String,
        consecutive_failures: u32,
        rollback_recommended: bool,
        at: DateTime<Utc>,
    },
    Rollback {
        rollback_id: Uuid,
        environment: String,
        snapshot_id: Uuid,
        step: String,
        outcome: StepOutcome,
        detail: Option<String>,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            PipelineEvent::StageProgress { .. } => topics::STAGE_PROGRESS,
            PipelineEvent::PipelineStatus { .. } => topics::PIPELINE_STATUS,
            PipelineEvent::TestProgress { .. } => topics::TEST_PROGRESS,
            PipelineEvent::DeploymentStatus { .. } => topics::DEPLOYMENT_STATUS,
            PipelineEvent::HealthAlert { .. } => topics::HEALTH,
            PipelineEvent::Rollback { .. } => topics::ROLLBACK,
        }
    }
}

/// Kinds of action recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConfigurationGenerated,
    PipelineStarted,
    PipelineFinished,
    PipelineCancelled,
    PipelineDenied,
    TestsTriggered,
    DeploymentRequested,
    DeploymentApproved,
    DeploymentRejected,
    DeploymentExecuted,
    DeploymentDenied,
    HealthSessionStarted,
    RollbackRecommended,
    RollbackStep,
    RollbackRejected,
    IssueFiled,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub description: String,
    pub actor: Option<String>,
    pub project_id: Option<String>,
    pub subject_id: Option<Uuid>,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            actor: None,
            project_id: None,
            subject_id: None,
            context: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn subject(mut self, id: Uuid) -> Self {
        self.subject_id = Some(id);
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_map_to_topics() {
        let ev = PipelineEvent::StageProgress {
            execution_id: Uuid::new_v4(),
            project_id: "p1".into(),
            stage: "build".into(),
            index: 2,
            status: StageStatus::Running,
            at: Utc::now(),
        };
        assert_eq!(ev.topic(), topics::STAGE_PROGRESS);

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "stage_progress");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn audit_entry_builder() {
        let id = Uuid::new_v4();
        let entry = AuditEntry::new(AuditAction::DeploymentApproved, "approved")
            .actor("lead")
            .project("p1")
            .subject(id)
            .context(serde_json::json!({"environment": "production"}));
        assert_eq!(entry.subject_id, Some(id));
        assert_eq!(entry.context["environment"], "production");
    }
}
