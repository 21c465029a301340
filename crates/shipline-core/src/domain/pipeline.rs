//! Pipeline executions and their stage records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::Actor;
use super::config::{PipelineConfiguration, StageKind};

/// Lifecycle of a pipeline execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One step within a pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
    pub attempts: u32,
}

impl StageRecord {
    pub fn pending(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            output: String::new(),
            error: None,
            attempts: 0,
        }
    }
}

/// What a caller asks the orchestrator to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTrigger {
    pub project_id: String,
    pub commit_id: String,
    pub branch: String,
    pub actor: Actor,
    pub environment: String,
    pub parameters: BTreeMap<String, String>,
}

impl PipelineTrigger {
    pub fn new(
        project_id: impl Into<String>,
        commit_id: impl Into<String>,
        branch: impl Into<String>,
        actor: Actor,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            commit_id: commit_id.into(),
            branch: branch.into(),
            actor,
            environment: environment.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// One run of the full pipeline for a specific commit on a specific branch.
///
/// Invariants:
/// - `status` stays `running` until every stage is terminal.
/// - `completed_at` is set iff `status` is not `running`.
/// - A terminal status is never changed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub project_id: String,
    pub configuration_id: Uuid,
    pub configuration_version: String,
    pub commit_id: String,
    pub branch: String,
    pub triggered_by: Actor,
    pub environment: String,
    pub parameters: BTreeMap<String, String>,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub error: Option<String>,
}

impl PipelineExecution {
    /// Create a running execution with one pending stage per template.
    pub fn new(trigger: PipelineTrigger, config: &PipelineConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: trigger.project_id,
            configuration_id: config.id,
            configuration_version: config.version.clone(),
            commit_id: trigger.commit_id,
            branch: trigger.branch,
            triggered_by: trigger.actor,
            environment: trigger.environment,
            parameters: trigger.parameters,
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            stages: config
                .stages
                .iter()
                .map(|t| StageRecord::pending(&t.name, t.kind))
                .collect(),
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == PipelineStatus::Running
    }

    /// Move stage `index` to `running`.
    ///
    /// Refused when the execution is terminal, the stage is not pending, or
    /// an earlier stage has not reached a terminal state.
    pub fn start_stage(&mut self, index: usize) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.stages[..index.min(self.stages.len())]
            .iter()
            .any(|s| !s.status.is_terminal())
        {
            return false;
        }
        match self.stages.get_mut(index) {
            Some(stage) if stage.status == StageStatus::Pending => {
                stage.status = StageStatus::Running;
                stage.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record the terminal state of a running stage.
    pub fn finish_stage(
        &mut self,
        index: usize,
        status: StageStatus,
        output: String,
        error: Option<String>,
        attempts: u32,
    ) -> bool {
        match self.stages.get_mut(index) {
            Some(stage) if stage.status == StageStatus::Running && status.is_terminal() => {
                stage.status = status;
                stage.completed_at = Some(Utc::now());
                stage.output = output;
                stage.error = error;
                stage.attempts = attempts;
                true
            }
            _ => false,
        }
    }

    /// Mark a pending stage as skipped without running it.
    pub fn skip_stage(&mut self, index: usize, reason: Option<String>) -> bool {
        match self.stages.get_mut(index) {
            Some(stage) if stage.status == StageStatus::Pending => {
                stage.status = StageStatus::Skipped;
                stage.completed_at = Some(Utc::now());
                stage.error = reason;
                true
            }
            _ => false,
        }
    }

    /// Skip every pending stage from `from` onward, returning their indices.
    pub fn skip_remaining(&mut self, from: usize) -> Vec<usize> {
        (from..self.stages.len())
            .filter(|&i| self.skip_stage(i, None))
            .collect()
    }

    /// Move the execution to a terminal status. No-op once terminal.
    pub fn complete(&mut self, status: PipelineStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::Role;
    use crate::domain::config::{
        DeploymentPolicy, DeploymentStrategy, Language, PipelineSettings, StageTemplate,
        TestPolicy,
    };

    fn config(stages: Vec<StageTemplate>) -> PipelineConfiguration {
        PipelineConfiguration {
            id: Uuid::new_v4(),
            project_id: "p1".into(),
            language: Language::Rust,
            platforms: vec![],
            stages,
            environments: vec![],
            test_policy: TestPolicy {
                suites: vec![],
                parallel_execution: false,
                max_concurrent_suites: 1,
                fail_fast: false,
                require_passing_for_merge: true,
            },
            deployment_policy: DeploymentPolicy {
                strategy: DeploymentStrategy::Rolling,
                rollback_on_failure: true,
                health_check_interval_secs: 30,
                monitoring_window_secs: 300,
                failure_threshold: 3,
            },
            settings: PipelineSettings::default(),
            created_at: Utc::now(),
            version: "1.0.0".into(),
            stages_digest: String::new(),
        }
    }

    fn execution() -> PipelineExecution {
        let cfg = config(vec![
            StageTemplate::new(StageKind::Setup, vec!["true".into()], 10),
            StageTemplate::new(StageKind::Build, vec!["true".into()], 10),
            StageTemplate::new(StageKind::Deploy, vec!["true".into()], 10),
        ]);
        let trigger = PipelineTrigger::new(
            "p1",
            "abc123",
            "main",
            Actor::new("dev", Role::Developer),
            "development",
        );
        PipelineExecution::new(trigger, &cfg)
    }

    #[test]
    fn new_execution_is_running_with_pending_stages() {
        let exec = execution();
        assert_eq!(exec.status, PipelineStatus::Running);
        assert!(exec.completed_at.is_none());
        assert!(exec.stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[test]
    fn stage_cannot_start_before_predecessor_is_terminal() {
        let mut exec = execution();
        assert!(!exec.start_stage(1));
        assert!(exec.start_stage(0));
        assert!(!exec.start_stage(1));
        assert!(exec.finish_stage(0, StageStatus::Success, "ok".into(), None, 1));
        assert!(exec.start_stage(1));
    }

    #[test]
    fn terminal_status_is_permanent() {
        let mut exec = execution();
        assert!(exec.complete(PipelineStatus::Failed, Some("boom".into())));
        assert!(exec.completed_at.is_some());
        assert!(!exec.complete(PipelineStatus::Success, None));
        assert_eq!(exec.status, PipelineStatus::Failed);
        assert!(!exec.start_stage(0));
    }

    #[test]
    fn skip_remaining_only_touches_pending() {
        let mut exec = execution();
        exec.start_stage(0);
        exec.finish_stage(0, StageStatus::Failed, String::new(), Some("x".into()), 1);
        let skipped = exec.skip_remaining(0);
        assert_eq!(skipped, vec![1, 2]);
        assert_eq!(exec.stages[0].status, StageStatus::Failed);
        assert_eq!(exec.stage("deploy").unwrap().status, StageStatus::Skipped);
    }
}
