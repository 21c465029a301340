//! Pipeline configuration model: stage templates, environments and policies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::{Actor, Role};
use super::health::HealthCheckSpec;
use super::testing::TestSuite;

/// Source ecosystem of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Language {
    Flutter,
    Rust,
    Node,
    Python,
    Go,
    Java,
    /// No built-in template; resolved to the generic no-op template.
    Other(String),
}

impl Language {
    /// Parse a language tag. Returns `None` for a blank tag.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        if tag.is_empty() {
            return None;
        }
        Some(match tag.as_str() {
            "flutter" | "dart" => Language::Flutter,
            "rust" => Language::Rust,
            "node" | "nodejs" | "javascript" | "typescript" => Language::Node,
            "python" => Language::Python,
            "go" | "golang" => Language::Go,
            "java" | "kotlin" => Language::Java,
            _ => Language::Other(tag),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Language::Flutter => "flutter",
            Language::Rust => "rust",
            Language::Node => "node",
            Language::Python => "python",
            Language::Go => "go",
            Language::Java => "java",
            Language::Other(tag) => tag,
        }
    }

    pub fn has_template(&self) -> bool {
        !matches!(self, Language::Other(_))
    }
}

impl From<String> for Language {
    fn from(s: String) -> Self {
        Language::parse(&s).unwrap_or(Language::Other(s))
    }
}

impl From<Language> for String {
    fn from(l: Language) -> Self {
        l.as_str().to_string()
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment target platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Platform {
    Android,
    Ios,
    Web,
    Linux,
    Macos,
    Windows,
    Server,
    Other(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Web => "web",
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Server => "server",
            Platform::Other(p) => p,
        }
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Platform::Android,
            "ios" => Platform::Ios,
            "web" => Platform::Web,
            "linux" => Platform::Linux,
            "macos" | "osx" => Platform::Macos,
            "windows" => Platform::Windows,
            "server" | "backend" => Platform::Server,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        Platform::from(s.as_str())
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.as_str().to_string()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builtin pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Setup,
    CodeQuality,
    Build,
    Test,
    SecurityScan,
    Package,
    Deploy,
    PostDeployTest,
    MonitorSetup,
    /// User-defined stage with no special orchestration behavior.
    Custom,
}

impl StageKind {
    pub const PIPELINE_ORDER: [StageKind; 9] = [
        StageKind::Setup,
        StageKind::CodeQuality,
        StageKind::Build,
        StageKind::Test,
        StageKind::SecurityScan,
        StageKind::Package,
        StageKind::Deploy,
        StageKind::PostDeployTest,
        StageKind::MonitorSetup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Setup => "setup",
            StageKind::CodeQuality => "code_quality",
            StageKind::Build => "build",
            StageKind::Test => "test",
            StageKind::SecurityScan => "security_scan",
            StageKind::Package => "package",
            StageKind::Deploy => "deploy",
            StageKind::PostDeployTest => "post_deploy_test",
            StageKind::MonitorSetup => "monitor_setup",
            StageKind::Custom => "custom",
        }
    }
}

/// One step of a pipeline plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub name: String,
    pub kind: StageKind,
    /// Shell command lines, executed in order.
    pub commands: Vec<String>,
    pub timeout_secs: u64,
    /// Additional attempts after the first failure.
    pub retry_count: u32,
    pub continue_on_error: bool,
    pub enabled: bool,
}

impl StageTemplate {
    pub fn new(kind: StageKind, commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            commands,
            timeout_secs,
            retry_count: 0,
            continue_on_error: false,
            enabled: true,
        }
    }

    pub fn custom(name: impl Into<String>, commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Custom,
            commands,
            timeout_secs,
            retry_count: 0,
            continue_on_error: false,
            enabled: true,
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A named deployment target with its own approval and variable policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    pub name: String,
    pub approval_required: bool,
    /// Roles allowed to approve deployments into this environment.
    pub approver_roles: Vec<Role>,
    /// Whether pushes deploy here without a manual trigger.
    pub auto_deploy: bool,
    pub variables: BTreeMap<String, String>,
    pub health_checks: Vec<HealthCheckSpec>,
}

impl EnvironmentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            approval_required: false,
            approver_roles: vec![Role::Lead, Role::Admin],
            auto_deploy: false,
            variables: BTreeMap::new(),
            health_checks: Vec::new(),
        }
    }

    pub fn requiring_approval(mut self, approvers: Vec<Role>) -> Self {
        self.approval_required = true;
        self.approver_roles = approvers;
        self
    }

    /// Whether `actor` holds a role with approval capability here.
    pub fn can_approve(&self, actor: &Actor) -> bool {
        self.approver_roles.contains(&actor.role)
    }

    /// Checks re-run after a rollback. Falls back to every check when none
    /// is marked critical.
    pub fn critical_checks(&self) -> Vec<HealthCheckSpec> {
        let critical: Vec<_> = self
            .health_checks
            .iter()
            .filter(|c| c.critical)
            .cloned()
            .collect();
        if critical.is_empty() {
            self.health_checks.clone()
        } else {
            critical
        }
    }
}

/// How suites are selected and scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPolicy {
    pub suites: Vec<TestSuite>,
    pub parallel_execution: bool,
    pub max_concurrent_suites: usize,
    pub fail_fast: bool,
    /// Pull requests are merge-ready only when every required suite passed.
    pub require_passing_for_merge: bool,
}

impl TestPolicy {
    pub fn enabled_suites(&self) -> impl Iterator<Item = &TestSuite> {
        self.suites.iter().filter(|s| s.enabled)
    }
}

/// Rollout strategy recorded on the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Rolling,
    BlueGreen,
    Canary,
}

/// Post-deploy monitoring and rollback policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    pub strategy: DeploymentStrategy,
    /// Roll back without human approval once monitoring recommends it.
    pub rollback_on_failure: bool,
    pub health_check_interval_secs: u64,
    pub monitoring_window_secs: u64,
    pub failure_threshold: u32,
}

/// Knobs that shape a generated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub enable_security_scan: bool,
    pub enable_post_deploy_checks: bool,
    pub require_staging_approval: bool,
    pub rollback_on_failure: bool,
    pub parallel_tests: bool,
    pub max_concurrent_suites: usize,
    pub fail_fast: bool,
    pub default_timeout_secs: u64,
    pub default_retry_count: u32,
    pub health_check_base_url: Option<String>,
    pub failure_threshold: u32,
    pub health_check_interval_secs: u64,
    pub monitoring_window_secs: u64,
    /// Refuse languages without a built-in template instead of degrading.
    pub strict_templates: bool,
    pub report_failures_as_issues: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_security_scan: false,
            enable_post_deploy_checks: true,
            require_staging_approval: false,
            rollback_on_failure: true,
            parallel_tests: true,
            max_concurrent_suites: 3,
            fail_fast: false,
            default_timeout_secs: 1_800,
            default_retry_count: 0,
            health_check_base_url: None,
            failure_threshold: 3,
            health_check_interval_secs: 30,
            monitoring_window_secs: 900,
            strict_templates: false,
            report_failures_as_issues: false,
        }
    }
}

/// Generated, versioned plan for a project.
///
/// The stage order is fixed at generation time and is the execution order
/// for every pipeline run against this version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    pub id: Uuid,
    pub project_id: String,
    pub language: Language,
    pub platforms: Vec<Platform>,
    pub stages: Vec<StageTemplate>,
    pub environments: Vec<EnvironmentDefinition>,
    pub test_policy: TestPolicy,
    pub deployment_policy: DeploymentPolicy,
    pub settings: PipelineSettings,
    pub created_at: DateTime<Utc>,
    /// Semantic version, bumped on regeneration.
    pub version: String,
    /// SHA-256 over ordered stage names and commands.
    pub stages_digest: String,
}

impl PipelineConfiguration {
    pub fn environment(&self, name: &str) -> Option<&EnvironmentDefinition> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageTemplate> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}
