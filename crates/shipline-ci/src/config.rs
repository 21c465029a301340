//! Pipeline configuration generation and the per-project registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use shipline_core::{
    AuditAction, AuditEntry, AuditRecorder, ConfigError, DeploymentPolicy, DeploymentStrategy,
    EnvironmentCatalog, EnvironmentDefinition, HealthCheckSpec, Language, PipelineConfiguration,
    PipelineError, PipelineSettings, Platform, ProjectStore, Role, StageKind, StageTemplate,
    StorageError, StorageResult, TestPolicy,
};

use crate::stage::{commands_for, default_suites};

/// Version assigned to a freshly generated configuration.
pub const INITIAL_VERSION: &str = "1.0.0";

pub const DEVELOPMENT: &str = "development";
pub const STAGING: &str = "staging";
pub const PRODUCTION: &str = "production";

/// Compute deterministic digest of ordered stage names and commands.
pub fn compute_stages_digest(stages: &[StageTemplate]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        hasher.update(stage.name.as_bytes());
        hasher.update(b"\0");
        for command in &stage.commands {
            hasher.update(command.as_bytes());
            hasher.update(b"\0");
        }
    }
    hex::encode(hasher.finalize())
}

/// Produces [`PipelineConfiguration`]s from a project's language profile.
///
/// Generation is a pure function of `(language, platforms, settings)`: only
/// the identifier and timestamp differ between two calls with equal inputs.
pub struct ConfigurationGenerator {
    audit: Arc<dyn AuditRecorder>,
}

impl ConfigurationGenerator {
    pub fn new(audit: Arc<dyn AuditRecorder>) -> Self {
        Self { audit }
    }

    /// Generate a configuration.
    ///
    /// Fails with `UnsupportedLanguage` for a blank tag, or for an unknown
    /// tag when `settings.strict_templates` is set. Unknown tags otherwise
    /// get the inert echo template.
    pub fn generate(
        &self,
        project_id: &str,
        language_tag: &str,
        platforms: &[Platform],
        settings: &PipelineSettings,
    ) -> Result<PipelineConfiguration, ConfigError> {
        let language = Language::parse(language_tag)
            .ok_or_else(|| ConfigError::UnsupportedLanguage(language_tag.to_string()))?;
        if settings.strict_templates && !language.has_template() {
            return Err(ConfigError::UnsupportedLanguage(language_tag.to_string()));
        }

        let stages = build_stages(&language, platforms, settings);
        let stages_digest = compute_stages_digest(&stages);
        let test_policy = build_test_policy(&language, settings);

        let config = PipelineConfiguration {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            language,
            platforms: platforms.to_vec(),
            stages,
            environments: build_environments(settings),
            test_policy,
            deployment_policy: build_deployment_policy(settings),
            settings: settings.clone(),
            created_at: Utc::now(),
            version: INITIAL_VERSION.to_string(),
            stages_digest,
        };

        info!(
            project_id,
            configuration_id = %config.id,
            language = %config.language,
            stages = config.stages.len(),
            "pipeline configuration generated"
        );
        self.audit.record(
            AuditEntry::new(
                AuditAction::ConfigurationGenerated,
                format!("generated {} pipeline for {project_id}", config.language),
            )
            .project(project_id)
            .subject(config.id)
            .context(json!({
                "version": config.version,
                "stages": config.stage_names(),
                "stages_digest": config.stages_digest,
            })),
        );
        Ok(config)
    }
}

fn build_stages(
    language: &Language,
    platforms: &[Platform],
    settings: &PipelineSettings,
) -> Vec<StageTemplate> {
    let base_url = settings.health_check_base_url.as_deref();
    StageKind::PIPELINE_ORDER
        .iter()
        .copied()
        .filter(|kind| match kind {
            StageKind::SecurityScan => settings.enable_security_scan,
            StageKind::PostDeployTest | StageKind::MonitorSetup => {
                settings.enable_post_deploy_checks
            }
            _ => true,
        })
        .map(|kind| {
            let commands = commands_for(language, kind, platforms, base_url);
            let template = StageTemplate::new(kind, commands, settings.default_timeout_secs);
            match kind {
                // Never re-run a scan that found something, nor a deployment.
                StageKind::SecurityScan | StageKind::Deploy => template,
                StageKind::MonitorSetup => template
                    .with_retries(settings.default_retry_count)
                    .continue_on_error(),
                _ => template.with_retries(settings.default_retry_count),
            }
        })
        .collect()
}

fn build_environments(settings: &PipelineSettings) -> Vec<EnvironmentDefinition> {
    let mut development = EnvironmentDefinition::new(DEVELOPMENT);
    development.auto_deploy = true;

    let mut staging = EnvironmentDefinition::new(STAGING);
    if settings.require_staging_approval {
        staging = staging.requiring_approval(vec![Role::Lead, Role::Admin]);
    }

    let production =
        EnvironmentDefinition::new(PRODUCTION).requiring_approval(vec![Role::Lead, Role::Admin]);

    [development, staging, production]
        .into_iter()
        .map(|mut env| {
            env.variables = environment_variables(&env.name, settings);
            env.health_checks = health_checks(&env.name, settings);
            env
        })
        .collect()
}

fn environment_variables(name: &str, settings: &PipelineSettings) -> BTreeMap<String, String> {
    let log_level = match name {
        DEVELOPMENT => "debug",
        STAGING => "info",
        _ => "warn",
    };
    let mut vars = BTreeMap::new();
    vars.insert("APP_ENV".to_string(), name.to_string());
    vars.insert("LOG_LEVEL".to_string(), log_level.to_string());
    if let Some(base) = environment_base_url(name, settings) {
        vars.insert("BASE_URL".to_string(), base);
    }
    vars
}

fn environment_base_url(name: &str, settings: &PipelineSettings) -> Option<String> {
    settings
        .health_check_base_url
        .as_deref()
        .map(|base| base.trim_end_matches('/').replace("{env}", name))
}

/// `/health` is critical and re-run during rollback; `/ready` is not.
fn health_checks(name: &str, settings: &PipelineSettings) -> Vec<HealthCheckSpec> {
    let Some(base) = environment_base_url(name, settings) else {
        return Vec::new();
    };
    vec![
        HealthCheckSpec::http("health", format!("{base}/health"), settings.failure_threshold)
            .critical(),
        HealthCheckSpec::http("ready", format!("{base}/ready"), settings.failure_threshold),
    ]
}

fn build_test_policy(language: &Language, settings: &PipelineSettings) -> TestPolicy {
    TestPolicy {
        suites: default_suites(language, settings.default_timeout_secs),
        parallel_execution: settings.parallel_tests,
        max_concurrent_suites: settings.max_concurrent_suites.max(1),
        fail_fast: settings.fail_fast,
        require_passing_for_merge: true,
    }
}

fn build_deployment_policy(settings: &PipelineSettings) -> DeploymentPolicy {
    DeploymentPolicy {
        strategy: DeploymentStrategy::Rolling,
        rollback_on_failure: settings.rollback_on_failure,
        health_check_interval_secs: settings.health_check_interval_secs,
        monitoring_window_secs: settings.monitoring_window_secs,
        failure_threshold: settings.failure_threshold,
    }
}

/// `1.4.2` becomes `1.5.0`. Unparseable versions restart the minor line.
pub fn bump_minor(version: &str) -> String {
    let mut parts = version.split('.').map(|p| p.parse::<u64>());
    match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => format!("{major}.{}.0", minor + 1),
        _ => "1.1.0".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Current configuration per project, generated on first use.
///
/// Configurations are handed out as `Arc`s and never mutated in place;
/// regeneration installs a new value, so running executions keep the
/// version they started with. Every version handed out stays reachable by
/// id for deployments linked to older executions.
pub struct ConfigurationRegistry {
    generator: ConfigurationGenerator,
    projects: Arc<dyn ProjectStore>,
    current: Mutex<HashMap<String, Arc<PipelineConfiguration>>>,
    versions: Mutex<HashMap<Uuid, Arc<PipelineConfiguration>>>,
}

impl ConfigurationRegistry {
    pub fn new(generator: ConfigurationGenerator, projects: Arc<dyn ProjectStore>) -> Self {
        Self {
            generator,
            projects,
            current: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
        }
    }

    fn current_map(&self) -> MutexGuard<'_, HashMap<String, Arc<PipelineConfiguration>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, config: &Arc<PipelineConfiguration>) {
        self.versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(config.id, Arc::clone(config));
    }

    /// A configuration version by id, current or superseded.
    pub fn version(&self, configuration_id: Uuid) -> Option<Arc<PipelineConfiguration>> {
        self.versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&configuration_id)
            .cloned()
    }

    /// Currently installed configuration, without generating.
    pub fn current(&self, project_id: &str) -> Option<Arc<PipelineConfiguration>> {
        self.current_map().get(project_id).cloned()
    }

    /// Install an externally built configuration as the project's current one.
    pub fn install(&self, config: PipelineConfiguration) -> Arc<PipelineConfiguration> {
        let config = Arc::new(config);
        self.current_map()
            .insert(config.project_id.clone(), Arc::clone(&config));
        self.remember(&config);
        config
    }

    /// Current configuration for `project_id`, generating it from the
    /// project store when none is installed.
    pub async fn resolve(&self, project_id: &str) -> Result<Arc<PipelineConfiguration>, PipelineError> {
        if let Some(config) = self.current(project_id) {
            return Ok(config);
        }
        let config = self.generate_from_store(project_id, INITIAL_VERSION).await?;

        // A concurrent resolve may have installed one first; keep theirs.
        let installed = Arc::clone(
            self.current_map()
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(config)),
        );
        self.remember(&installed);
        Ok(installed)
    }

    /// Regenerate from the project's current settings, bumping the minor
    /// version of the previous configuration.
    pub async fn regenerate(&self, project_id: &str) -> Result<Arc<PipelineConfiguration>, PipelineError> {
        let version = match self.current(project_id) {
            Some(previous) => bump_minor(&previous.version),
            None => INITIAL_VERSION.to_string(),
        };
        let config = self.generate_from_store(project_id, &version).await?;
        debug!(project_id, version = %config.version, "configuration regenerated");
        Ok(self.install(config))
    }

    async fn generate_from_store(
        &self,
        project_id: &str,
        version: &str,
    ) -> Result<PipelineConfiguration, PipelineError> {
        let profile = self
            .projects
            .project(project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound(project_id.to_string()))?;
        let mut config = self.generator.generate(
            &profile.project_id,
            &profile.language,
            &profile.platforms,
            &profile.settings,
        )?;
        config.version = version.to_string();
        Ok(config)
    }

    /// Configuration backing the catalog. Projects that are missing or
    /// cannot be configured are reported, not treated as having no
    /// environments.
    async fn lookup(&self, project_id: &str) -> StorageResult<Arc<PipelineConfiguration>> {
        match self.resolve(project_id).await {
            Ok(config) => Ok(config),
            Err(PipelineError::Storage(err)) => Err(err),
            Err(PipelineError::ProjectNotFound(id)) => Err(StorageError::NotFound(format!("project {id}"))),
            Err(err) => Err(StorageError::Backend(format!(
                "configuration for {project_id} unavailable: {err}"
            ))),
        }
    }
}

#[async_trait]
impl EnvironmentCatalog for ConfigurationRegistry {
    async fn environment(
        &self,
        project_id: &str,
        name: &str,
    ) -> StorageResult<Option<EnvironmentDefinition>> {
        Ok(self.lookup(project_id).await?.environment(name).cloned())
    }

    async fn deployment_policy(&self, project_id: &str) -> StorageResult<Option<DeploymentPolicy>> {
        Ok(Some(self.lookup(project_id).await?.deployment_policy.clone()))
    }
}
