//! Rollback to a verified snapshot.
//!
//! Steps, in order:
//! 1. mark the environment's active deployment `rolled_back`
//! 2. restore the snapshot's config files on a rollback branch and redeploy
//!    the snapshot commit
//! 3. probe the environment's critical health checks once each
//!
//! Every step is audited and broadcast whatever its outcome. A failure in
//! step 2 or 3 is `RollbackFailed` and is never retried automatically.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::{
    Actor, AuditAction, AuditEntry, EnvironmentDefinition, PipelineEvent, Snapshot,
    SourceControlError, StepOutcome,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::ports::{
    AuditRecorder, DeploymentExecutor, EnvironmentCatalog, EventBus, SnapshotStore,
    SourceControlProvider,
};
use crate::retry::{retry_with_backoff, RetryPolicy};

use super::error::RollbackError;
use super::monitor::AutoRollback;
use super::probe::HealthProbe;
use super::trigger::DeploymentTrigger;

pub const STEP_MARK_ROLLED_BACK: &str = "mark_rolled_back";
pub const STEP_RESTORE: &str = "restore_and_redeploy";
pub const STEP_VERIFY: &str = "verify_health";

/// One executed rollback step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub name: String,
    pub outcome: StepOutcome,
    pub detail: Option<String>,
}

/// Record of a completed rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub rollback_id: Uuid,
    pub environment: String,
    pub snapshot_id: Uuid,
    pub reason: String,
    pub actor: Actor,
    /// Deployment request moved to `rolled_back`, if one was active.
    pub rolled_back_request: Option<Uuid>,
    pub rollback_branch: String,
    pub redeploy_output: String,
    pub steps: Vec<RollbackStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub struct RollbackController {
    deployments: Arc<DeploymentTrigger>,
    snapshots: Arc<dyn SnapshotStore>,
    catalog: Arc<dyn EnvironmentCatalog>,
    source_control: Arc<dyn SourceControlProvider>,
    executor: Arc<dyn DeploymentExecutor>,
    probe: Arc<dyn HealthProbe>,
    audit: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventBus>,
    retry: RetryPolicy,
}

/// Per-call bookkeeping shared by the steps.
struct Run<'a> {
    rollback_id: Uuid,
    environment: &'a str,
    snapshot_id: Uuid,
    actor: &'a Actor,
    steps: Vec<RollbackStep>,
}

impl RollbackController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployments: Arc<DeploymentTrigger>,
        snapshots: Arc<dyn SnapshotStore>,
        catalog: Arc<dyn EnvironmentCatalog>,
        source_control: Arc<dyn SourceControlProvider>,
        executor: Arc<dyn DeploymentExecutor>,
        probe: Arc<dyn HealthProbe>,
        audit: Arc<dyn AuditRecorder>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            deployments,
            snapshots,
            catalog,
            source_control,
            executor,
            probe,
            audit,
            events,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff for source control calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Roll `environment` back to `snapshot_id`.
    ///
    /// Target validation happens before any mutation: a missing, foreign or
    /// unverified snapshot is `InvalidTarget` and leaves every record as is.
    /// Gated environments only accept rollbacks from their approver roles.
    pub async fn rollback(
        &self,
        environment: &str,
        snapshot_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> Result<RollbackResult, RollbackError> {
        self.execute(environment, snapshot_id, reason, actor, false)
            .await
    }

    async fn execute(
        &self,
        environment: &str,
        snapshot_id: Uuid,
        reason: &str,
        actor: &Actor,
        policy_authorized: bool,
    ) -> Result<RollbackResult, RollbackError> {
        let started_at = Utc::now();
        let snapshot = self.validate_target(environment, snapshot_id, actor).await?;
        let env = self.environment(&snapshot).await?;

        if !policy_authorized && env.approval_required && !env.can_approve(actor) {
            self.reject(environment, snapshot_id, actor, "actor lacks approval role");
            return Err(RollbackError::InsufficientPermission {
                actor: actor.to_string(),
                environment: environment.to_string(),
            });
        }

        let mut run = Run {
            rollback_id: Uuid::new_v4(),
            environment,
            snapshot_id,
            actor,
            steps: Vec::with_capacity(3),
        };
        info!(rollback_id = %run.rollback_id, environment, %snapshot_id, reason, "rollback started");

        // Step 1
        let active = self
            .deployments
            .active_deployment(&snapshot.project_id, environment);
        let rolled_back_request = match active {
            Some(active) => match self.deployments.mark_rolled_back(active.id) {
                Ok(_) => {
                    let detail = Some(active.id.to_string());
                    self.step(&mut run, STEP_MARK_ROLLED_BACK, StepOutcome::Succeeded, detail);
                    Some(active.id)
                }
                Err(err) => {
                    return Err(self.fail(&mut run, STEP_MARK_ROLLED_BACK, err.to_string()))
                }
            },
            None => {
                let detail = Some("no active deployment".to_string());
                self.step(&mut run, STEP_MARK_ROLLED_BACK, StepOutcome::Skipped, detail);
                None
            }
        };

        // Step 2
        let branch = format!("rollback/{}/{}", environment, snapshot.short_commit());
        let redeploy_output = match self.restore(&snapshot, &branch, reason).await {
            Ok(output) => {
                self.step(&mut run, STEP_RESTORE, StepOutcome::Succeeded, Some(branch.clone()));
                output
            }
            Err(reason) => return Err(self.fail(&mut run, STEP_RESTORE, reason)),
        };

        // Step 3
        let checks = env.critical_checks();
        if checks.is_empty() {
            let detail = Some("no health checks".to_string());
            self.step(&mut run, STEP_VERIFY, StepOutcome::Skipped, detail);
        } else {
            let mut failing = Vec::new();
            for check in &checks {
                let outcome = self.probe.probe(check).await;
                if !outcome.passed {
                    failing.push(match outcome.message {
                        Some(m) => format!("{}: {m}", check.id),
                        None => check.id.clone(),
                    });
                }
            }
            if !failing.is_empty() {
                return Err(self.fail(&mut run, STEP_VERIFY, failing.join("; ")));
            }
            let detail = Some(format!("{} checks passed", checks.len()));
            self.step(&mut run, STEP_VERIFY, StepOutcome::Succeeded, detail);
        }

        METRICS.inc_rollbacks();
        info!(rollback_id = %run.rollback_id, environment, "rollback completed");
        Ok(RollbackResult {
            rollback_id: run.rollback_id,
            environment: environment.to_string(),
            snapshot_id,
            reason: reason.to_string(),
            actor: actor.clone(),
            rolled_back_request,
            rollback_branch: branch,
            redeploy_output,
            steps: run.steps,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn validate_target(
        &self,
        environment: &str,
        snapshot_id: Uuid,
        actor: &Actor,
    ) -> Result<Snapshot, RollbackError> {
        let problem = match self.snapshots.get(snapshot_id).await? {
            None => format!("snapshot {snapshot_id} does not exist"),
            Some(s) if s.environment != environment => format!(
                "snapshot {snapshot_id} belongs to {}, not {environment}",
                s.environment
            ),
            Some(s) if !s.verified => format!("snapshot {snapshot_id} is not verified"),
            Some(s) => return Ok(s),
        };
        self.reject(environment, snapshot_id, actor, &problem);
        Err(RollbackError::InvalidTarget(problem))
    }

    async fn environment(&self, snapshot: &Snapshot) -> Result<EnvironmentDefinition, RollbackError> {
        self.catalog
            .environment(&snapshot.project_id, &snapshot.environment)
            .await?
            .ok_or_else(|| {
                RollbackError::InvalidTarget(format!(
                    "environment {} is not defined for project {}",
                    snapshot.environment, snapshot.project_id
                ))
            })
    }

    /// Create the rollback branch, commit the snapshot's config files onto
    /// it, then redeploy the snapshot commit.
    async fn restore(
        &self,
        snapshot: &Snapshot,
        branch: &str,
        reason: &str,
    ) -> Result<String, String> {
        let project = snapshot.project_id.as_str();
        let transient = |e: &SourceControlError| e.is_transient();

        let created = retry_with_backoff(&self.retry, transient, |_| {
            self.source_control
                .create_branch(project, branch, &snapshot.commit_id)
        })
        .await;
        created.result.map_err(|e| format!("create branch {branch}: {e}"))?;

        if !snapshot.config_files.is_empty() {
            let message = format!(
                "Restore {} config from {}: {reason}",
                snapshot.environment,
                snapshot.short_commit()
            );
            let committed = retry_with_backoff(&self.retry, transient, |_| {
                self.source_control
                    .create_commit(project, branch, &message, &snapshot.config_files)
            })
            .await;
            committed.result.map_err(|e| format!("commit config files: {e}"))?;
        }

        self.executor
            .redeploy(snapshot)
            .await
            .map_err(|e| format!("redeploy {}: {e:#}", snapshot.short_commit()))
    }

    // -----------------------------------------------------------------------
    // Step reporting
    // -----------------------------------------------------------------------

    fn step(&self, run: &mut Run<'_>, name: &str, outcome: StepOutcome, detail: Option<String>) {
        obs::emit_rollback_step(run.rollback_id, name, outcome);
        self.audit.record(
            AuditEntry::new(AuditAction::RollbackStep, format!("rollback step {name}: {outcome:?}"))
                .actor(run.actor.name.clone())
                .subject(run.rollback_id)
                .context(json!({
                    "environment": run.environment,
                    "snapshot_id": run.snapshot_id,
                    "step": name,
                    "outcome": outcome,
                    "detail": detail,
                })),
        );
        self.events.broadcast(PipelineEvent::Rollback {
            rollback_id: run.rollback_id,
            environment: run.environment.to_string(),
            snapshot_id: run.snapshot_id,
            step: name.to_string(),
            outcome,
            detail: detail.clone(),
            at: Utc::now(),
        });
        run.steps.push(RollbackStep {
            name: name.to_string(),
            outcome,
            detail,
        });
    }

    fn fail(&self, run: &mut Run<'_>, step: &str, reason: String) -> RollbackError {
        error!(rollback_id = %run.rollback_id, step, %reason, "rollback failed; escalate to a human");
        self.step(run, step, StepOutcome::Failed, Some(reason.clone()));
        RollbackError::RollbackFailed {
            step: step.to_string(),
            reason,
        }
    }

    fn reject(&self, environment: &str, snapshot_id: Uuid, actor: &Actor, problem: &str) {
        self.audit.record(
            AuditEntry::new(AuditAction::RollbackRejected, problem.to_string())
                .actor(actor.name.clone())
                .subject(snapshot_id)
                .context(json!({ "environment": environment })),
        );
    }
}

#[async_trait]
impl AutoRollback for RollbackController {
    async fn auto_rollback(
        &self,
        environment: &str,
        snapshot_id: Uuid,
        reason: &str,
    ) -> Result<RollbackResult, RollbackError> {
        self.execute(environment, snapshot_id, reason, &Actor::system(), true)
            .await
    }
}
