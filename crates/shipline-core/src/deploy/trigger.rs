//! Approval-gated deployment requests.
//!
//! A request into an environment with `approval_required` is parked in
//! `pending_approval` until a distinct, authorized actor approves or rejects
//! it. Otherwise it moves straight to `executing`. The transition out of
//! `pending_approval` is taken under a lock so exactly one decision wins.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    Actor, AuditAction, AuditEntry, DeploymentRequest, DeploymentStatus, EnvironmentDefinition,
    PipelineEvent, Snapshot,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::ports::{AuditRecorder, DeploymentExecutor, EnvironmentCatalog, EventBus, SnapshotStore};

use super::error::{DeployError, DeployResult};

/// Notified after a deployment resolves to `success`.
#[async_trait]
pub trait DeploymentListener: Send + Sync {
    async fn deployed(&self, request: &DeploymentRequest, environment: &EnvironmentDefinition);
}

/// Creates, gates and executes deployment requests.
pub struct DeploymentTrigger {
    catalog: Arc<dyn EnvironmentCatalog>,
    executor: Arc<dyn DeploymentExecutor>,
    snapshots: Arc<dyn SnapshotStore>,
    audit: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventBus>,
    listener: Option<Arc<dyn DeploymentListener>>,
    requests: Mutex<Vec<DeploymentRequest>>,
    /// Bumped on every published status change.
    changes: watch::Sender<u64>,
}

impl DeploymentTrigger {
    pub fn new(
        catalog: Arc<dyn EnvironmentCatalog>,
        executor: Arc<dyn DeploymentExecutor>,
        snapshots: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditRecorder>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            catalog,
            executor,
            snapshots,
            audit,
            events,
            listener: None,
            requests: Mutex::new(Vec::new()),
            changes: watch::channel(0).0,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DeploymentListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn requests(&self) -> MutexGuard<'_, Vec<DeploymentRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn environment(&self, project_id: &str, name: &str) -> DeployResult<EnvironmentDefinition> {
        self.catalog
            .environment(project_id, name)
            .await?
            .ok_or_else(|| DeployError::EnvironmentNotFound {
                project_id: project_id.to_string(),
                environment: name.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Request a deployment of `version` into `environment`.
    ///
    /// Returns immediately with `pending_approval` when the environment is
    /// gated; otherwise runs the deployment and returns the resolved request.
    pub async fn trigger_deployment(
        &self,
        project_id: &str,
        environment: &str,
        version: &str,
        reason: &str,
        actor: &Actor,
    ) -> DeployResult<DeploymentRequest> {
        let request = DeploymentRequest::new(
            project_id,
            environment,
            version,
            reason,
            actor.clone(),
            DeploymentStatus::Executing,
        );
        self.submit(request).await
    }

    /// Same as [`trigger_deployment`](Self::trigger_deployment), linking the
    /// request to the pipeline execution that reached its deploy stage and
    /// to the configuration version that execution runs.
    pub async fn trigger_linked(
        &self,
        project_id: &str,
        environment: &str,
        version: &str,
        actor: &Actor,
        execution_id: Uuid,
        configuration_id: Uuid,
    ) -> DeployResult<DeploymentRequest> {
        let mut request = DeploymentRequest::new(
            project_id,
            environment,
            version,
            format!("pipeline execution {execution_id}"),
            actor.clone(),
            DeploymentStatus::Executing,
        );
        request.execution_id = Some(execution_id);
        request.configuration_id = Some(configuration_id);
        self.submit(request).await
    }

    async fn submit(&self, mut request: DeploymentRequest) -> DeployResult<DeploymentRequest> {
        let actor = request.requested_by.clone();
        if !actor.role.can_trigger() {
            self.deny(&actor, "trigger deployment", &request.project_id, None);
            return Err(DeployError::InsufficientPermission {
                actor: actor.to_string(),
                action: format!("deploy to {}", request.environment),
            });
        }
        let env = self.environment(&request.project_id, &request.environment).await?;

        if env.approval_required {
            request.status = DeploymentStatus::PendingApproval;
        }
        self.requests().push(request.clone());

        self.audit.record(
            AuditEntry::new(
                AuditAction::DeploymentRequested,
                format!(
                    "deployment of {} to {} requested",
                    request.version, request.environment
                ),
            )
            .actor(actor.name.clone())
            .project(request.project_id.clone())
            .subject(request.id)
            .context(json!({
                "environment": request.environment,
                "version": request.version,
                "reason": request.reason,
                "approval_required": env.approval_required,
            })),
        );
        self.publish(&request);

        if env.approval_required {
            info!(request_id = %request.id, environment = %request.environment, "deployment parked for approval");
            return Ok(request);
        }
        Ok(self.execute(request, &env).await)
    }

    /// Approve a parked request and run it.
    pub async fn approve(&self, request_id: Uuid, approver: &Actor) -> DeployResult<DeploymentRequest> {
        let request = self.get(request_id)?;
        let env = self.environment(&request.project_id, &request.environment).await?;
        self.authorize_decision(&request, &env, approver, "approve")?;

        {
            let mut requests = self.requests();
            let slot = find_mut(&mut requests, request_id)?;
            if slot.status != DeploymentStatus::PendingApproval {
                return Err(DeployError::AlreadyDecided {
                    id: request_id,
                    status: slot.status.to_string(),
                });
            }
            let now = Utc::now();
            slot.status = DeploymentStatus::Approved;
            slot.decided_at = Some(now);
            slot.decided_by = Some(approver.clone());
            let approved = slot.clone();
            slot.status = DeploymentStatus::Executing;
            drop(requests);
            self.publish(&approved);
        }

        self.audit.record(
            AuditEntry::new(
                AuditAction::DeploymentApproved,
                format!("deployment to {} approved", request.environment),
            )
            .actor(approver.name.clone())
            .project(request.project_id.clone())
            .subject(request_id),
        );
        let executing = self.get(request_id)?;
        self.publish(&executing);

        Ok(self.execute(executing, &env).await)
    }

    /// Reject a parked request, storing the reason.
    pub async fn reject(
        &self,
        request_id: Uuid,
        approver: &Actor,
        reason: &str,
    ) -> DeployResult<DeploymentRequest> {
        let request = self.get(request_id)?;
        let env = self.environment(&request.project_id, &request.environment).await?;
        self.authorize_decision(&request, &env, approver, "reject")?;

        let rejected = {
            let mut requests = self.requests();
            let slot = find_mut(&mut requests, request_id)?;
            if slot.status != DeploymentStatus::PendingApproval {
                return Err(DeployError::AlreadyDecided {
                    id: request_id,
                    status: slot.status.to_string(),
                });
            }
            let now = Utc::now();
            slot.status = DeploymentStatus::Rejected;
            slot.decided_at = Some(now);
            slot.decided_by = Some(approver.clone());
            slot.rejection_reason = Some(reason.to_string());
            slot.completed_at = Some(now);
            slot.clone()
        };

        self.audit.record(
            AuditEntry::new(
                AuditAction::DeploymentRejected,
                format!("deployment to {} rejected", rejected.environment),
            )
            .actor(approver.name.clone())
            .project(rejected.project_id.clone())
            .subject(request_id)
            .context(json!({ "reason": reason })),
        );
        self.publish(&rejected);
        Ok(rejected)
    }

    /// Mark a successful request as rolled back.
    pub fn mark_rolled_back(&self, request_id: Uuid) -> DeployResult<DeploymentRequest> {
        let updated = {
            let mut requests = self.requests();
            let slot = find_mut(&mut requests, request_id)?;
            if slot.status != DeploymentStatus::Success {
                return Err(DeployError::AlreadyDecided {
                    id: request_id,
                    status: slot.status.to_string(),
                });
            }
            slot.status = DeploymentStatus::RolledBack;
            slot.completed_at = Some(Utc::now());
            slot.clone()
        };
        self.publish(&updated);
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Wait until a request resolves. A parked request resolves once it is
    /// rejected, or approved and run.
    pub async fn wait_resolved(&self, request_id: Uuid) -> DeployResult<DeploymentRequest> {
        let mut changes = self.changes.subscribe();
        loop {
            let request = self.get(request_id)?;
            if request.status.is_resolved() || changes.changed().await.is_err() {
                return Ok(request);
            }
        }
    }

    pub fn get(&self, request_id: Uuid) -> DeployResult<DeploymentRequest> {
        self.requests()
            .iter()
            .find(|r| r.id == request_id)
            .cloned()
            .ok_or(DeployError::RequestNotFound(request_id))
    }

    /// Outstanding requests, oldest first.
    pub fn get_pending_approvals(&self, environment: Option<&str>) -> Vec<DeploymentRequest> {
        self.requests()
            .iter()
            .filter(|r| r.status == DeploymentStatus::PendingApproval)
            .filter(|r| environment.map_or(true, |e| r.environment == e))
            .cloned()
            .collect()
    }

    /// Recent resolved requests, newest first.
    pub fn get_deployment_history(
        &self,
        environment: Option<&str>,
        limit: usize,
    ) -> Vec<DeploymentRequest> {
        self.requests()
            .iter()
            .rev()
            .filter(|r| r.status.is_resolved())
            .filter(|r| environment.map_or(true, |e| r.environment == e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The latest successful deployment into an environment.
    pub fn active_deployment(&self, project_id: &str, environment: &str) -> Option<DeploymentRequest> {
        self.requests()
            .iter()
            .rev()
            .find(|r| {
                r.project_id == project_id
                    && r.environment == environment
                    && r.status == DeploymentStatus::Success
            })
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn authorize_decision(
        &self,
        request: &DeploymentRequest,
        env: &EnvironmentDefinition,
        approver: &Actor,
        action: &str,
    ) -> DeployResult<()> {
        let self_decision = approver.name == request.requested_by.name;
        if env.can_approve(approver) && !self_decision {
            return Ok(());
        }
        let what = format!("{action} deployment to {}", request.environment);
        self.deny(approver, &what, &request.project_id, Some(request.id));
        Err(DeployError::InsufficientPermission {
            actor: approver.to_string(),
            action: what,
        })
    }

    fn deny(&self, actor: &Actor, action: &str, project_id: &str, subject: Option<Uuid>) {
        warn!(actor = %actor, action, "deployment action denied");
        let mut entry = AuditEntry::new(AuditAction::DeploymentDenied, format!("{actor} may not {action}"))
            .actor(actor.name.clone())
            .project(project_id);
        if let Some(id) = subject {
            entry = entry.subject(id);
        }
        self.audit.record(entry);
    }

    /// Run an `executing` request to `success` or `failed`.
    ///
    /// The request is `executing`; only this routine moves it further.
    async fn execute(&self, request: DeploymentRequest, env: &EnvironmentDefinition) -> DeploymentRequest {
        let request_id = request.id;
        let outcome = self.executor.deploy(&request).await;
        METRICS.inc_deployments_executed();

        let resolved = {
            let mut requests = self.requests();
            let Some(slot) = requests.iter_mut().find(|r| r.id == request_id) else {
                return request;
            };
            slot.completed_at = Some(Utc::now());
            match &outcome {
                Ok(output) => {
                    slot.status = DeploymentStatus::Success;
                    slot.output = output.clone();
                }
                Err(err) => {
                    slot.status = DeploymentStatus::Failed;
                    slot.error = Some(format!("{err:#}"));
                }
            }
            slot.clone()
        };

        self.audit.record(
            AuditEntry::new(
                AuditAction::DeploymentExecuted,
                format!(
                    "deployment of {} to {} {}",
                    resolved.version, resolved.environment, resolved.status
                ),
            )
            .actor(resolved.requested_by.name.clone())
            .project(resolved.project_id.clone())
            .subject(request_id)
            .context(json!({ "status": resolved.status, "error": resolved.error })),
        );
        self.publish(&resolved);

        if resolved.status == DeploymentStatus::Success {
            self.capture_snapshot(&resolved, env).await;
            if let Some(listener) = &self.listener {
                listener.deployed(&resolved, env).await;
            }
        }
        resolved
    }

    /// Record the deployed state as a future rollback target. Environments
    /// without health checks have nothing to wait for, so their snapshot is
    /// verified on capture.
    async fn capture_snapshot(&self, request: &DeploymentRequest, env: &EnvironmentDefinition) {
        let mut snapshot = Snapshot::new(&request.project_id, &request.environment, &request.version);
        snapshot.deployment_id = Some(request.id);
        if !env.variables.is_empty() {
            let rendered: String = env
                .variables
                .iter()
                .map(|(k, v)| format!("{k}={v}\n"))
                .collect();
            snapshot
                .config_files
                .insert(format!("deploy/{}.env", env.name), rendered);
        }
        snapshot.verified = env.health_checks.is_empty();
        if let Err(err) = self.snapshots.save(snapshot).await {
            warn!(request_id = %request.id, error = %err, "failed to capture deployment snapshot");
        }
    }

    fn publish(&self, request: &DeploymentRequest) {
        obs::emit_deployment_status(request.id, &request.environment, request.status);
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
        self.events.broadcast(PipelineEvent::DeploymentStatus {
            request_id: request.id,
            project_id: request.project_id.clone(),
            environment: request.environment.clone(),
            version: request.version.clone(),
            status: request.status,
            at: Utc::now(),
        });
    }
}

fn find_mut(requests: &mut [DeploymentRequest], id: Uuid) -> DeployResult<&mut DeploymentRequest> {
    requests
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or(DeployError::RequestNotFound(id))
}
