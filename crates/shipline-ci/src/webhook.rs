//! Webhook classification and dispatch.
//!
//! - push: full pipeline into `development`; a pushed release tag goes to
//!   `production`
//! - release `published` with a version tag: full pipeline into `production`
//! - pull request `opened` / `synchronize`: tests only, no deployment
//! - anything else is ignored

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use shipline_core::{Actor, PipelineError, PipelineTrigger, Role, TestExecution};

use crate::config::{DEVELOPMENT, PRODUCTION};
use crate::pipeline::{ExecutionHandle, PipelineOrchestrator};
use crate::test_trigger::AutomatedTestTrigger;

/// `v?MAJOR.MINOR.PATCH[-pre]`
pub const RELEASE_TAG_PATTERN: &str = r"^v?\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?$";

/// Inbound source control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    Push {
        commit_id: String,
        /// Branch name or full ref (`refs/heads/..`, `refs/tags/..`).
        branch: String,
        actor: String,
    },
    PullRequest {
        action: String,
        pr_id: u64,
        source_branch: String,
        target_branch: String,
        actor: String,
    },
    Release {
        action: String,
        tag_name: String,
        actor: String,
    },
}

/// What an event resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRoute {
    Pipeline(PipelineTrigger),
    Tests {
        pr_id: u64,
        source_branch: String,
        target_branch: String,
        author: String,
    },
    Ignored(String),
}

/// Result of dispatching an event.
pub enum WebhookDispatch {
    Started(ExecutionHandle),
    Tested(TestExecution),
    Ignored(String),
}

pub struct WebhookRouter {
    release_tag: Regex,
    actor_role: Role,
}

impl WebhookRouter {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_release_pattern(RELEASE_TAG_PATTERN)
    }

    pub fn with_release_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            release_tag: Regex::new(pattern)?,
            actor_role: Role::Developer,
        })
    }

    /// Role granted to webhook senders, who are identified by name only.
    pub fn with_actor_role(mut self, role: Role) -> Self {
        self.actor_role = role;
        self
    }

    pub fn is_release_tag(&self, tag: &str) -> bool {
        self.release_tag.is_match(tag)
    }

    /// Classify `event` for `project_id` without side effects.
    pub fn route(&self, project_id: &str, event: &WebhookEvent) -> WebhookRoute {
        match event {
            WebhookEvent::Push {
                commit_id,
                branch,
                actor,
            } => {
                if let Some(tag) = branch.strip_prefix("refs/tags/") {
                    if !self.is_release_tag(tag) {
                        return WebhookRoute::Ignored(format!("tag {tag} is not a release version"));
                    }
                    return self.pipeline(project_id, commit_id, tag, actor, PRODUCTION);
                }
                let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                self.pipeline(project_id, commit_id, branch, actor, DEVELOPMENT)
            }
            WebhookEvent::Release {
                action,
                tag_name,
                actor,
            } => {
                if action != "published" {
                    return WebhookRoute::Ignored(format!("release action {action}"));
                }
                if !self.is_release_tag(tag_name) {
                    return WebhookRoute::Ignored(format!("tag {tag_name} is not a release version"));
                }
                self.pipeline(project_id, tag_name, tag_name, actor, PRODUCTION)
            }
            WebhookEvent::PullRequest {
                action,
                pr_id,
                source_branch,
                target_branch,
                actor,
            } => match action.as_str() {
                "opened" | "synchronize" => WebhookRoute::Tests {
                    pr_id: *pr_id,
                    source_branch: source_branch.clone(),
                    target_branch: target_branch.clone(),
                    author: actor.clone(),
                },
                other => WebhookRoute::Ignored(format!("pull request action {other}")),
            },
        }
    }

    fn pipeline(
        &self,
        project_id: &str,
        commit_id: &str,
        branch: &str,
        actor: &str,
        environment: &str,
    ) -> WebhookRoute {
        WebhookRoute::Pipeline(PipelineTrigger::new(
            project_id,
            commit_id,
            branch,
            Actor::new(actor, self.actor_role),
            environment,
        ))
    }

    /// Route `event` and start whatever it resolves to.
    pub async fn dispatch(
        &self,
        project_id: &str,
        event: &WebhookEvent,
        orchestrator: &Arc<PipelineOrchestrator>,
        tests: &AutomatedTestTrigger,
    ) -> Result<WebhookDispatch, PipelineError> {
        match self.route(project_id, event) {
            WebhookRoute::Pipeline(trigger) => {
                info!(project_id, branch = %trigger.branch, environment = %trigger.environment, "webhook starts pipeline");
                Ok(WebhookDispatch::Started(orchestrator.start(trigger).await?))
            }
            WebhookRoute::Tests {
                pr_id,
                source_branch,
                target_branch,
                author,
            } => {
                info!(project_id, pr_id, "webhook triggers pull request tests");
                let run = tests
                    .trigger_on_pull_request(project_id, pr_id, &source_branch, &target_branch, &author)
                    .await?;
                Ok(WebhookDispatch::Tested(run))
            }
            WebhookRoute::Ignored(reason) => {
                debug!(project_id, %reason, "webhook ignored");
                Ok(WebhookDispatch::Ignored(reason))
            }
        }
    }
}
