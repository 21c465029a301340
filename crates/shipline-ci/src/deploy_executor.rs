//! Deployment executor backed by the configuration's deploy stage.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use uuid::Uuid;

use shipline_core::{
    DeploymentExecutor, DeploymentRequest, PipelineConfiguration, Snapshot, StageKind,
};

use crate::config::ConfigurationRegistry;
use crate::runner::{StageContext, StageExecutor};

/// Runs the project's `deploy` stage template for deployments and
/// rollback redeploys.
///
/// A deployment linked to a pipeline execution uses the configuration
/// version that execution ran; anything else uses the current one.
pub struct StageDeploymentExecutor {
    registry: Arc<ConfigurationRegistry>,
    executor: Arc<dyn StageExecutor>,
}

impl StageDeploymentExecutor {
    pub fn new(registry: Arc<ConfigurationRegistry>, executor: Arc<dyn StageExecutor>) -> Self {
        Self { registry, executor }
    }

    async fn configuration(
        &self,
        project_id: &str,
        configuration_id: Option<Uuid>,
    ) -> anyhow::Result<Arc<PipelineConfiguration>> {
        match configuration_id {
            Some(id) => self
                .registry
                .version(id)
                .ok_or_else(|| anyhow!("configuration {id} of {project_id} is not known")),
            None => self
                .registry
                .resolve(project_id)
                .await
                .with_context(|| format!("resolving configuration for {project_id}")),
        }
    }

    async fn run_deploy_stage(
        &self,
        config: &PipelineConfiguration,
        environment: &str,
        commit_id: &str,
        extra: &[(&str, String)],
    ) -> anyhow::Result<String> {
        let project_id = config.project_id.as_str();
        let template = config
            .stage(StageKind::Deploy)
            .ok_or_else(|| anyhow!("configuration {} has no deploy stage", config.id))?;

        let mut ctx = StageContext::new(project_id, commit_id, commit_id, environment)
            .with_variable("SHIPLINE_DEPLOY_VERSION", commit_id);
        if let Some(env) = config.environment(environment) {
            ctx.variables.extend(env.variables.clone());
        }
        for (key, value) in extra {
            ctx.variables.insert(key.to_string(), value.clone());
        }

        let result = self.executor.execute(template, &ctx).await;
        if result.success {
            Ok(result.output)
        } else {
            Err(anyhow!(result
                .error_message()
                .unwrap_or_else(|| "deploy stage failed".to_string())))
        }
    }
}

#[async_trait]
impl DeploymentExecutor for StageDeploymentExecutor {
    async fn deploy(&self, request: &DeploymentRequest) -> anyhow::Result<String> {
        let config = self
            .configuration(&request.project_id, request.configuration_id)
            .await?;
        self.run_deploy_stage(
            &config,
            &request.environment,
            &request.version,
            &[("SHIPLINE_DEPLOYMENT_ID", request.id.to_string())],
        )
        .await
    }

    async fn redeploy(&self, snapshot: &Snapshot) -> anyhow::Result<String> {
        let config = self.configuration(&snapshot.project_id, None).await?;
        self.run_deploy_stage(
            &config,
            &snapshot.environment,
            &snapshot.commit_id,
            &[("SHIPLINE_ROLLBACK_SNAPSHOT", snapshot.id.to_string())],
        )
        .await
    }
}
