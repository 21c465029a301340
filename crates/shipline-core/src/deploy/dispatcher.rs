//! Deploy-stage hand-off.
//!
//! The orchestrator does not call the deployment trigger directly. When an
//! execution reaches its deploy stage it sends a [`DeployStageReached`]
//! message and awaits the [`DeployOutcome`] reply. The dispatcher task owns
//! the deployment policy decisions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Actor, DeploymentRequest, DeploymentStatus};

use super::trigger::DeploymentTrigger;

/// Published by the orchestrator when an execution reaches `deploy`.
#[derive(Debug)]
pub struct DeployStageReached {
    pub execution_id: Uuid,
    /// Configuration version the execution runs; deploy commands come from it.
    pub configuration_id: Uuid,
    pub project_id: String,
    pub environment: String,
    /// Version label; the execution's commit id.
    pub version: String,
    pub actor: Actor,
    pub reply: oneshot::Sender<DeployOutcome>,
}

/// Reply to a [`DeployStageReached`] message.
///
/// Gated environments reply only once the request is decided, so the
/// deploy stage stays running while it waits for approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed { request_id: Uuid, output: String },
    Failed {
        request_id: Option<Uuid>,
        reason: String,
    },
}

/// Sending half held by orchestrators. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeploymentDispatcher {
    tx: mpsc::Sender<DeployStageReached>,
}

impl DeploymentDispatcher {
    /// Spawn the subscriber task that feeds messages to `trigger`.
    ///
    /// Each message is handled on its own task, so a slow deployment or one
    /// parked behind approval does not hold up the others.
    pub fn spawn(trigger: Arc<DeploymentTrigger>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DeployStageReached>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                debug!(execution_id = %msg.execution_id, environment = %msg.environment, "deploy stage reached");
                let trigger = Arc::clone(&trigger);
                tokio::spawn(async move {
                    let outcome = handle_stage(&trigger, &msg).await;
                    if msg.reply.send(outcome).is_err() {
                        warn!(execution_id = %msg.execution_id, "deploy outcome dropped; orchestrator went away");
                    }
                });
            }
        });
        (Self { tx }, handle)
    }

    /// Publish a deploy-stage message and wait for the outcome.
    pub async fn dispatch(
        &self,
        execution_id: Uuid,
        configuration_id: Uuid,
        project_id: &str,
        environment: &str,
        version: &str,
        actor: &Actor,
    ) -> DeployOutcome {
        let (reply, rx) = oneshot::channel();
        let msg = DeployStageReached {
            execution_id,
            configuration_id,
            project_id: project_id.to_string(),
            environment: environment.to_string(),
            version: version.to_string(),
            actor: actor.clone(),
            reply,
        };
        if self.tx.send(msg).await.is_err() {
            return DeployOutcome::Failed {
                request_id: None,
                reason: "deployment dispatcher is not running".into(),
            };
        }
        rx.await.unwrap_or_else(|_| DeployOutcome::Failed {
            request_id: None,
            reason: "deployment dispatcher dropped the request".into(),
        })
    }
}

async fn handle_stage(trigger: &DeploymentTrigger, msg: &DeployStageReached) -> DeployOutcome {
    let requested = trigger
        .trigger_linked(
            &msg.project_id,
            &msg.environment,
            &msg.version,
            &msg.actor,
            msg.execution_id,
            msg.configuration_id,
        )
        .await;

    let request = match requested {
        Ok(req) if req.status == DeploymentStatus::PendingApproval => {
            info!(request_id = %req.id, execution_id = %msg.execution_id, "deploy stage waiting for approval");
            match trigger.wait_resolved(req.id).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    return DeployOutcome::Failed {
                        request_id: Some(req.id),
                        reason: err.to_string(),
                    }
                }
            }
        }
        Ok(req) => req,
        Err(err) => {
            return DeployOutcome::Failed {
                request_id: None,
                reason: err.to_string(),
            }
        }
    };
    outcome_of(request)
}

fn outcome_of(req: DeploymentRequest) -> DeployOutcome {
    match req.status {
        DeploymentStatus::Success => DeployOutcome::Deployed {
            request_id: req.id,
            output: req.output,
        },
        DeploymentStatus::Rejected => {
            let by = req
                .decided_by
                .map(|actor| actor.name)
                .unwrap_or_else(|| "unknown".into());
            DeployOutcome::Failed {
                request_id: Some(req.id),
                reason: format!(
                    "deployment rejected by {by}: {}",
                    req.rejection_reason.unwrap_or_default()
                ),
            }
        }
        other => DeployOutcome::Failed {
            request_id: Some(req.id),
            reason: req
                .error
                .unwrap_or_else(|| format!("deployment ended {other}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{EnvironmentDefinition, Role};
    use crate::fakes::{
        MemoryAuditRecorder, MemoryEnvironmentCatalog, MemorySnapshotStore, RecordingEventBus,
        ScriptedDeploymentExecutor,
    };

    fn wire(executor: Arc<ScriptedDeploymentExecutor>) -> (DeploymentDispatcher, Arc<DeploymentTrigger>) {
        let catalog = Arc::new(MemoryEnvironmentCatalog::new());
        catalog.insert_environment("p1", EnvironmentDefinition::new("development"));
        catalog.insert_environment(
            "p1",
            EnvironmentDefinition::new("production").requiring_approval(vec![Role::Lead]),
        );
        let trigger = Arc::new(DeploymentTrigger::new(
            catalog,
            executor,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemoryAuditRecorder::new()),
            Arc::new(RecordingEventBus::new()),
        ));
        (DeploymentDispatcher::spawn(Arc::clone(&trigger), 8).0, trigger)
    }

    fn dispatcher(executor: Arc<ScriptedDeploymentExecutor>) -> DeploymentDispatcher {
        wire(executor).0
    }

    async fn parked(trigger: &DeploymentTrigger) -> DeploymentRequest {
        loop {
            if let Some(req) = trigger.get_pending_approvals(Some("production")).pop() {
                return req;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn outcomes_follow_environment_policy() {
        let executor = Arc::new(ScriptedDeploymentExecutor::new());
        let d = dispatcher(executor.clone());
        let actor = Actor::new("dana", Role::Developer);
        let (exec, config) = (Uuid::new_v4(), Uuid::new_v4());

        let dev = d.dispatch(exec, config, "p1", "development", "abc", &actor).await;
        assert!(matches!(dev, DeployOutcome::Deployed { .. }));

        executor.push_deploy(Err("boom".into()));
        let failed = d.dispatch(exec, config, "p1", "development", "abc", &actor).await;
        match failed {
            DeployOutcome::Failed { request_id, reason } => {
                assert!(request_id.is_some());
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let missing = d.dispatch(exec, config, "p1", "qa", "abc", &actor).await;
        assert!(matches!(missing, DeployOutcome::Failed { request_id: None, .. }));
    }

    #[tokio::test]
    async fn gated_deploy_replies_after_approval() {
        let executor = Arc::new(ScriptedDeploymentExecutor::new());
        let (d, trigger) = wire(executor.clone());
        let actor = Actor::new("dana", Role::Developer);

        let pending = tokio::spawn(async move {
            d.dispatch(Uuid::new_v4(), Uuid::new_v4(), "p1", "production", "abc", &actor)
                .await
        });
        let req = parked(&trigger).await;
        assert!(!pending.is_finished());
        assert!(executor.deployed().is_empty());

        trigger.approve(req.id, &Actor::new("lee", Role::Lead)).await.unwrap();
        let outcome = pending.await.unwrap();
        assert_eq!(
            outcome,
            DeployOutcome::Deployed {
                request_id: req.id,
                output: "deployed abc to production".into(),
            }
        );
    }

    #[tokio::test]
    async fn gated_deploy_rejection_fails() {
        let (d, trigger) = wire(Arc::new(ScriptedDeploymentExecutor::new()));
        let actor = Actor::new("dana", Role::Developer);

        let pending = tokio::spawn(async move {
            d.dispatch(Uuid::new_v4(), Uuid::new_v4(), "p1", "production", "abc", &actor)
                .await
        });
        let req = parked(&trigger).await;
        trigger
            .reject(req.id, &Actor::new("lee", Role::Lead), "freeze week")
            .await
            .unwrap();

        match pending.await.unwrap() {
            DeployOutcome::Failed { request_id, reason } => {
                assert_eq!(request_id, Some(req.id));
                assert_eq!(reason, "deployment rejected by lee: freeze week");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_deploys_run_concurrently() {
        let executor =
            Arc::new(ScriptedDeploymentExecutor::new().with_deploy_delay(Duration::from_secs(5)));
        let d = dispatcher(executor.clone());
        let actor = Actor::new("dana", Role::Developer);

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            d.dispatch(Uuid::new_v4(), Uuid::new_v4(), "p1", "development", "abc", &actor),
            d.dispatch(Uuid::new_v4(), Uuid::new_v4(), "p1", "development", "def", &actor),
        );
        let elapsed = started.elapsed();

        assert!(matches!(first, DeployOutcome::Deployed { .. }));
        assert!(matches!(second, DeployOutcome::Deployed { .. }));
        assert_eq!(executor.deployed().len(), 2);
        assert!(elapsed < Duration::from_secs(10), "deploys ran serially: {elapsed:?}");
    }
}
