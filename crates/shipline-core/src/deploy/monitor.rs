//! Post-deploy health monitoring.
//!
//! A session tracks consecutive-failure counters per health check for one
//! deployment. The monitor only recommends a rollback; acting on the
//! recommendation is left to the caller, or to an [`AutoRollback`] hook when
//! the deployment policy sets `rollback_on_failure`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    AuditAction, AuditEntry, CheckResult, DeploymentPolicy, DeploymentRequest,
    EnvironmentDefinition, HealthCheckSpec, HealthObservation, HealthSession, PipelineEvent,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::ports::{AuditRecorder, EnvironmentCatalog, EventBus, SnapshotStore};

use super::error::{MonitorError, MonitorResult, RollbackError};
use super::probe::HealthProbe;
use super::rollback::RollbackResult;
use super::trigger::DeploymentListener;

/// Performs a rollback without human approval.
#[async_trait]
pub trait AutoRollback: Send + Sync {
    async fn auto_rollback(
        &self,
        environment: &str,
        snapshot_id: Uuid,
        reason: &str,
    ) -> Result<RollbackResult, RollbackError>;
}

/// Timing and policy for a polling routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingPlan {
    pub project_id: String,
    pub interval: Duration,
    pub window: Duration,
    pub rollback_on_failure: bool,
}

impl PollingPlan {
    pub fn from_policy(project_id: impl Into<String>, policy: &DeploymentPolicy) -> Self {
        Self {
            project_id: project_id.into(),
            interval: Duration::from_secs(policy.health_check_interval_secs.max(1)),
            window: Duration::from_secs(policy.monitoring_window_secs),
            rollback_on_failure: policy.rollback_on_failure,
        }
    }
}

/// What happened after a rollback was recommended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackDisposition {
    /// Automatic rollback is off; a human decides.
    AwaitingDecision,
    NoVerifiedSnapshot,
    Completed { rollback_id: Uuid },
    Failed { reason: String },
}

/// How a polling routine ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingOutcome {
    /// The window elapsed without a recommendation.
    Healthy { verified_snapshot: Option<Uuid> },
    RollbackRecommended {
        failing_check: Option<String>,
        disposition: RollbackDisposition,
    },
    /// The session was closed by someone else.
    Closed,
}

struct SessionEntry {
    deployment_id: Uuid,
    session: Arc<tokio::sync::Mutex<HealthSession>>,
}

/// Owns every health session and the routines that poll them.
pub struct DeploymentMonitor {
    probe: Arc<dyn HealthProbe>,
    snapshots: Arc<dyn SnapshotStore>,
    audit: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventBus>,
    auto_rollback: Option<Arc<dyn AutoRollback>>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

impl DeploymentMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        snapshots: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditRecorder>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            probe,
            snapshots,
            audit,
            events,
            auto_rollback: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auto_rollback(mut self, hook: Arc<dyn AutoRollback>) -> Self {
        self.auto_rollback = Some(hook);
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, session_id: Uuid) -> MonitorResult<Arc<tokio::sync::Mutex<HealthSession>>> {
        self.sessions()
            .get(&session_id)
            .map(|e| e.session.clone())
            .ok_or(MonitorError::SessionNotFound(session_id))
    }

    /// Open a new session with every counter at zero.
    pub fn start_session(
        &self,
        deployment_id: Uuid,
        environment: &str,
        checks: Vec<HealthCheckSpec>,
    ) -> Uuid {
        let session = HealthSession::new(deployment_id, environment, checks, Utc::now());
        let session_id = session.session_id;
        let check_ids: Vec<_> = session.checks.iter().map(|c| c.spec.id.clone()).collect();

        self.sessions().insert(
            session_id,
            SessionEntry {
                deployment_id,
                session: Arc::new(tokio::sync::Mutex::new(session)),
            },
        );

        info!(%session_id, %deployment_id, environment, "health session started");
        self.audit.record(
            AuditEntry::new(
                AuditAction::HealthSessionStarted,
                format!("monitoring deployment {deployment_id} in {environment}"),
            )
            .subject(session_id)
            .context(json!({ "deployment_id": deployment_id, "checks": check_ids })),
        );
        session_id
    }

    /// Probe every check in the session once and apply the results.
    ///
    /// Holding the session lock across the probes keeps each session's
    /// counters owned by a single observer at a time.
    pub async fn observe(&self, session_id: Uuid) -> MonitorResult<HealthObservation> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        if session.is_closed() {
            return Err(MonitorError::SessionClosed(session_id));
        }

        let specs: Vec<HealthCheckSpec> = session.checks.iter().map(|c| c.spec.clone()).collect();
        let mut results = Vec::with_capacity(specs.len());
        let mut newly_failing = None;

        for spec in &specs {
            let outcome = self.probe.probe(spec).await;
            let now = Utc::now();
            let flipped = session.record(&spec.id, outcome.passed, outcome.message.clone(), now);
            let consecutive_failures = session.counter(&spec.id).unwrap_or(0);
            debug!(%session_id, check = %spec.id, passed = outcome.passed, consecutive_failures, "health probe");

            if flipped {
                newly_failing = Some(spec.id.clone());
                self.alert(&session, &spec.id, consecutive_failures);
            }
            results.push(CheckResult {
                check_id: spec.id.clone(),
                passed: outcome.passed,
                consecutive_failures,
                message: outcome.message,
            });
        }

        Ok(HealthObservation {
            session_id,
            deployment_id: session.deployment_id,
            results,
            rollback_recommended: session.rollback_recommended,
            newly_failing_check: newly_failing,
            observed_at: Utc::now(),
        })
    }

    /// Copy of the current session state.
    pub async fn session(&self, session_id: Uuid) -> MonitorResult<HealthSession> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Most recent session opened for a deployment.
    pub async fn session_for_deployment(&self, deployment_id: Uuid) -> Option<HealthSession> {
        let handles: Vec<_> = self
            .sessions()
            .values()
            .filter(|e| e.deployment_id == deployment_id)
            .map(|e| e.session.clone())
            .collect();
        let mut latest: Option<HealthSession> = None;
        for handle in handles {
            let s = handle.lock().await.clone();
            if latest.as_ref().map_or(true, |l| s.started_at > l.started_at) {
                latest = Some(s);
            }
        }
        latest
    }

    /// Close a session. The session stays readable as history.
    pub async fn close_session(&self, session_id: Uuid) -> MonitorResult<()> {
        let handle = self.handle(session_id)?;
        handle.lock().await.close(Utc::now());
        Ok(())
    }

    fn alert(&self, session: &HealthSession, check_id: &str, consecutive_failures: u32) {
        METRICS.inc_health_alerts();
        obs::emit_health_alert(session.session_id, check_id, consecutive_failures);
        self.events.broadcast(PipelineEvent::HealthAlert {
            session_id: session.session_id,
            deployment_id: session.deployment_id,
            environment: session.environment.clone(),
            check_id: check_id.to_string(),
            consecutive_failures,
            rollback_recommended: true,
            at: Utc::now(),
        });
        self.audit.record(
            AuditEntry::new(
                AuditAction::RollbackRecommended,
                format!("health check {check_id} failed {consecutive_failures} times in a row"),
            )
            .subject(session.deployment_id)
            .context(json!({
                "session_id": session.session_id,
                "environment": session.environment,
                "check_id": check_id,
            })),
        );
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Poll the session on `plan.interval` until `plan.window` elapses or a
    /// rollback is recommended. Runs independently of pipeline progress.
    pub fn spawn_polling(
        self: &Arc<Self>,
        session_id: Uuid,
        plan: PollingPlan,
    ) -> JoinHandle<MonitorResult<PollingOutcome>> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.poll(session_id, plan).await })
    }

    async fn poll(&self, session_id: Uuid, plan: PollingPlan) -> MonitorResult<PollingOutcome> {
        let deadline = Instant::now() + plan.window;
        let mut ticker = tokio::time::interval(plan.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if Instant::now() >= deadline {
                break;
            }
            let observation = match self.observe(session_id).await {
                Ok(o) => o,
                Err(MonitorError::SessionClosed(_)) => return Ok(PollingOutcome::Closed),
                Err(e) => return Err(e),
            };
            if observation.rollback_recommended {
                let session = self.session(session_id).await?;
                self.close_session(session_id).await?;
                let disposition = self.act_on_recommendation(&session, &plan).await;
                return Ok(PollingOutcome::RollbackRecommended {
                    failing_check: session.failing_check,
                    disposition,
                });
            }
        }

        let session = self.session(session_id).await?;
        if session.is_closed() {
            return Ok(PollingOutcome::Closed);
        }
        self.close_session(session_id).await?;
        let verified_snapshot = self.verify_snapshot(session.deployment_id).await;
        info!(%session_id, ?verified_snapshot, "monitoring window elapsed healthy");
        Ok(PollingOutcome::Healthy { verified_snapshot })
    }

    async fn act_on_recommendation(
        &self,
        session: &HealthSession,
        plan: &PollingPlan,
    ) -> RollbackDisposition {
        let hook = match (&self.auto_rollback, plan.rollback_on_failure) {
            (Some(hook), true) => hook,
            _ => return RollbackDisposition::AwaitingDecision,
        };

        let target = match self
            .snapshots
            .latest_verified(&plan.project_id, &session.environment)
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(environment = %session.environment, "no verified snapshot to roll back to");
                return RollbackDisposition::NoVerifiedSnapshot;
            }
            Err(err) => {
                return RollbackDisposition::Failed {
                    reason: err.to_string(),
                }
            }
        };

        let reason = format!(
            "health check {} crossed its failure threshold",
            session.failing_check.as_deref().unwrap_or("unknown")
        );
        match hook.auto_rollback(&session.environment, target.id, &reason).await {
            Ok(result) => RollbackDisposition::Completed {
                rollback_id: result.rollback_id,
            },
            Err(err) => RollbackDisposition::Failed {
                reason: err.to_string(),
            },
        }
    }

    async fn verify_snapshot(&self, deployment_id: Uuid) -> Option<Uuid> {
        let snapshot = self.snapshots.for_deployment(deployment_id).await.ok()??;
        match self.snapshots.mark_verified(snapshot.id).await {
            Ok(()) => Some(snapshot.id),
            Err(err) => {
                warn!(snapshot_id = %snapshot.id, error = %err, "failed to mark snapshot verified");
                None
            }
        }
    }
}

/// Starts monitoring every successful deployment into an environment that
/// defines health checks.
pub struct MonitorLauncher {
    monitor: Arc<DeploymentMonitor>,
    catalog: Arc<dyn EnvironmentCatalog>,
    default_policy: DeploymentPolicy,
}

impl MonitorLauncher {
    pub fn new(
        monitor: Arc<DeploymentMonitor>,
        catalog: Arc<dyn EnvironmentCatalog>,
        default_policy: DeploymentPolicy,
    ) -> Self {
        Self {
            monitor,
            catalog,
            default_policy,
        }
    }
}

#[async_trait]
impl DeploymentListener for MonitorLauncher {
    async fn deployed(&self, request: &DeploymentRequest, environment: &EnvironmentDefinition) {
        if environment.health_checks.is_empty() {
            return;
        }
        let policy = match self.catalog.deployment_policy(&request.project_id).await {
            Ok(Some(p)) => p,
            Ok(None) => self.default_policy.clone(),
            Err(err) => {
                warn!(error = %err, "deployment policy lookup failed, using defaults");
                self.default_policy.clone()
            }
        };
        let session_id = self.monitor.start_session(
            request.id,
            &environment.name,
            environment.health_checks.clone(),
        );
        let plan = PollingPlan::from_policy(&request.project_id, &policy);
        // Detached: the routine reports through events and audit entries.
        let _ = self.monitor.spawn_polling(session_id, plan);
    }
}
