//! Shipline CLI
//!
//! The `shipline` command plans and runs CI/CD pipelines locally.
//!
//! ## Commands
//!
//! - `generate`: Print the pipeline configuration for a project
//! - `run`: Run a full pipeline against the working tree
//! - `webhook`: Route a source control event payload and act on it

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};

use shipline_ci::{
    AutomatedTestTrigger, CommandStageExecutor, ConfigurationGenerator, ConfigurationRegistry,
    PipelineOrchestrator, StageDeploymentExecutor, StageExecutor, WebhookDispatch, WebhookEvent,
    WebhookRouter,
};
use shipline_core::fakes::{MemoryExecutionHistory, MemoryProjectStore, MemorySnapshotStore};
use shipline_core::metrics::METRICS;
use shipline_core::{
    Actor, BroadcastEventBus, DeploymentDispatcher, DeploymentStatus, DeploymentTrigger,
    PipelineEvent, PipelineExecution, PipelineSettings, PipelineStatus, PipelineTrigger,
    Platform, ProjectProfile, Role, StageStatus, TestExecution, TracingAuditRecorder,
};

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "shipline.toml";

#[derive(Parser)]
#[command(name = "shipline")]
#[command(version = shipline_core::VERSION)]
#[command(about = "CI/CD pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Project file (default: ./shipline.toml when present)
    #[arg(long, global = true, env = "SHIPLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Project selection shared by every command. Flags override the file.
#[derive(clap::Args, Debug, Clone, Default)]
struct ProjectArgs {
    /// Project identifier
    #[arg(long)]
    project: Option<String>,

    /// Language tag (flutter, rust, node, python, go, java, ...)
    #[arg(long)]
    language: Option<String>,

    /// Target platform, repeatable
    #[arg(long = "platform")]
    platforms: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and print the pipeline configuration
    Generate {
        #[command(flatten)]
        project: ProjectArgs,

        /// Write the configuration JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a pipeline against the current working tree
    Run {
        #[command(flatten)]
        project: ProjectArgs,

        /// Commit identifier recorded on the execution
        #[arg(long, default_value = "HEAD")]
        commit: String,

        /// Branch recorded on the execution
        #[arg(long, default_value = "main")]
        branch: String,

        /// Target environment
        #[arg(short, long, default_value = "development")]
        environment: String,

        /// Who is triggering the run
        #[arg(long, default_value = "local")]
        actor: String,

        /// Role of the triggering actor
        #[arg(long, default_value = "developer")]
        role: Role,

        /// Lead who approves gated deployments requested by this run
        #[arg(long)]
        approver: Option<String>,
    },

    /// Dispatch a webhook payload (JSON) as if received from source control
    Webhook {
        #[command(flatten)]
        project: ProjectArgs,

        /// Path to the event payload
        #[arg(long)]
        event: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Project file
// ---------------------------------------------------------------------------

/// Contents of `shipline.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    project: ProjectSection,
    settings: PipelineSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProjectSection {
    id: Option<String>,
    language: Option<String>,
    platforms: Vec<String>,
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                return Ok(FileConfig::default());
            }
            fallback
        }
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Merge flags over the file into a project profile.
fn resolve_profile(args: &ProjectArgs, file: &FileConfig) -> Result<ProjectProfile> {
    let project_id = args
        .project
        .clone()
        .or_else(|| file.project.id.clone())
        .context("No project given: pass --project or set [project].id")?;
    let language = args
        .language
        .clone()
        .or_else(|| file.project.language.clone())
        .context("No language given: pass --language or set [project].language")?;
    let platforms = if args.platforms.is_empty() {
        &file.project.platforms
    } else {
        &args.platforms
    };

    Ok(ProjectProfile {
        project_id,
        language,
        platforms: platforms.iter().map(|p| Platform::from(p.as_str())).collect(),
        settings: file.settings.clone(),
    })
}

// ---------------------------------------------------------------------------
// Local stack
// ---------------------------------------------------------------------------

/// Everything a local run needs, backed by in-process stores.
struct LocalStack {
    orchestrator: Arc<PipelineOrchestrator>,
    registry: Arc<ConfigurationRegistry>,
    tests: Arc<AutomatedTestTrigger>,
}

/// Build the stack. With an `approver`, gated deployments are approved in
/// their name as soon as they are requested.
fn local_stack(profile: ProjectProfile, approver: Option<Actor>) -> LocalStack {
    let audit = Arc::new(TracingAuditRecorder);
    let events = Arc::new(BroadcastEventBus::new(256));
    let projects = Arc::new(MemoryProjectStore::new());
    projects.insert(profile);

    let registry = Arc::new(ConfigurationRegistry::new(
        ConfigurationGenerator::new(audit.clone()),
        projects,
    ));
    let executor: Arc<dyn StageExecutor> = Arc::new(CommandStageExecutor::new());

    let tests = Arc::new(AutomatedTestTrigger::new(
        registry.clone(),
        executor.clone(),
        audit.clone(),
        events.clone(),
    ));
    // The process exits after the run, so no health monitoring is attached.
    let deployments = Arc::new(DeploymentTrigger::new(
        registry.clone(),
        Arc::new(StageDeploymentExecutor::new(registry.clone(), executor.clone())),
        Arc::new(MemorySnapshotStore::new()),
        audit.clone(),
        events.clone(),
    ));
    if let Some(approver) = approver {
        tokio::spawn(approve_requests(deployments.clone(), events.subscribe(), approver));
    }
    let (dispatcher, _task) = DeploymentDispatcher::spawn(deployments, 16);

    let orchestrator = PipelineOrchestrator::new(
        registry.clone(),
        executor,
        Arc::new(MemoryExecutionHistory::new()),
        audit,
        events,
    )
    .with_test_trigger(tests.clone())
    .with_dispatcher(dispatcher);

    LocalStack {
        orchestrator: Arc::new(orchestrator),
        registry,
        tests,
    }
}

async fn approve_requests(
    deployments: Arc<DeploymentTrigger>,
    mut events: broadcast::Receiver<PipelineEvent>,
    approver: Actor,
) {
    loop {
        let pending = match events.recv().await {
            Ok(PipelineEvent::DeploymentStatus {
                request_id,
                status: DeploymentStatus::PendingApproval,
                ..
            }) => vec![request_id],
            Ok(_) => continue,
            // Missed events may have included a request; sweep for it.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "approver fell behind the event stream");
                deployments
                    .get_pending_approvals(None)
                    .into_iter()
                    .map(|r| r.id)
                    .collect()
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        for request_id in pending {
            match deployments.approve(request_id, &approver).await {
                Ok(request) => {
                    info!(%request_id, approver = %approver, status = %request.status, "deployment approved")
                }
                Err(err) => warn!(%request_id, error = %err, "could not approve deployment"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipline_core::telemetry::init_tracing(cli.json, level);

    let file = load_config(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Generate { project, output } => {
            cmd_generate(&resolve_profile(&project, &file)?, output.as_deref())
        }
        Commands::Run {
            project,
            commit,
            branch,
            environment,
            actor,
            role,
            approver,
        } => {
            let profile = resolve_profile(&project, &file)?;
            let actor = Actor::new(actor, role);
            let approver = approver.map(|name| Actor::new(name, Role::Lead));
            cmd_run(profile, &commit, &branch, &environment, actor, approver).await
        }
        Commands::Webhook { project, event } => {
            cmd_webhook(resolve_profile(&project, &file)?, &event).await
        }
    };

    METRICS.flush();
    result
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_generate(profile: &ProjectProfile, output: Option<&Path>) -> Result<()> {
    let generator = ConfigurationGenerator::new(Arc::new(TracingAuditRecorder));
    let config = generator
        .generate(
            &profile.project_id,
            &profile.language,
            &profile.platforms,
            &profile.settings,
        )
        .context("Failed to generate pipeline configuration")?;
    let json = serde_json::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), version = %config.version, "configuration written");
            println!("Wrote configuration {} ({}) to {}", config.version, config.stages_digest, path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_run(
    profile: ProjectProfile,
    commit: &str,
    branch: &str,
    environment: &str,
    actor: Actor,
    approver: Option<Actor>,
) -> Result<()> {
    if approver.as_ref().is_some_and(|a| a.name == actor.name) {
        bail!("Approver must differ from the triggering actor {}", actor.name);
    }
    let project_id = profile.project_id.clone();
    let stack = local_stack(profile, approver.clone());

    // A gated deploy waits for its decision; without an approver it never comes.
    let config = stack
        .registry
        .resolve(&project_id)
        .await
        .context("Failed to resolve pipeline configuration")?;
    let gated = config
        .environment(environment)
        .is_some_and(|env| env.approval_required);
    if gated && approver.is_none() {
        bail!("Environment {environment} requires approval: pass --approver <name>");
    }

    let trigger = PipelineTrigger::new(project_id, commit, branch, actor, environment);

    let execution = stack
        .orchestrator
        .run(trigger)
        .await
        .context("Pipeline failed to run")?;
    print_execution(&execution);

    if execution.status == PipelineStatus::Success {
        println!("\n✓ Pipeline succeeded");
        Ok(())
    } else {
        bail!(
            "Pipeline {:?}: {}",
            execution.status,
            execution.error.as_deref().unwrap_or("no error recorded")
        )
    }
}

async fn cmd_webhook(profile: ProjectProfile, event_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(event_path)
        .with_context(|| format!("Failed to read event payload {}", event_path.display()))?;
    let event: WebhookEvent = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid event payload {}", event_path.display()))?;

    let project_id = profile.project_id.clone();
    let stack = local_stack(profile, None);
    let router = WebhookRouter::new().context("Invalid release tag pattern")?;

    let dispatch = router
        .dispatch(&project_id, &event, &stack.orchestrator, &stack.tests)
        .await
        .context("Webhook dispatch failed")?;

    match dispatch {
        WebhookDispatch::Started(handle) => {
            println!("Started pipeline {}", handle.execution_id());
            let execution = handle.wait().await.context("Pipeline failed to run")?;
            print_execution(&execution);
            if execution.status != PipelineStatus::Success {
                bail!("Pipeline {:?}", execution.status);
            }
        }
        WebhookDispatch::Tested(run) => {
            print_tests(&run);
            if !run.merge_ready {
                bail!("Pull request is not ready to merge");
            }
        }
        WebhookDispatch::Ignored(reason) => println!("Ignored: {reason}"),
    }
    Ok(())
}

fn print_execution(execution: &PipelineExecution) {
    println!("Execution: {}", execution.id);
    println!(
        "Project: {} @ {} ({})",
        execution.project_id, execution.branch, execution.environment
    );
    println!("Status: {:?}", execution.status);
    if let Some(ms) = execution.duration_ms() {
        println!("Duration: {ms}ms");
    }
    println!();
    for stage in &execution.stages {
        let mark = match stage.status {
            StageStatus::Success => "✓",
            StageStatus::Skipped => "-",
            _ => "✗",
        };
        print!("  {} {} [{}]", mark, stage.name, stage.status.as_str());
        if stage.attempts > 1 {
            print!(" after {} attempts", stage.attempts);
        }
        println!();
        if let Some(err) = &stage.error {
            println!("      {err}");
        }
    }
}

fn print_tests(run: &TestExecution) {
    println!("Test execution: {}", run.id);
    println!("Status: {:?}", run.status);
    for suite in &run.suites {
        println!("  {} {:?} ({}ms)", suite.suite, suite.status, suite.duration_ms);
    }
    println!("Merge ready: {}", run.merge_ready);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(project: &str, language: &str) -> ProjectArgs {
        ProjectArgs {
            project: Some(project.to_string()),
            language: Some(language.to_string()),
            platforms: vec![],
        }
    }

    #[test]
    fn config_file_supplies_project_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipline.toml");
        std::fs::write(
            &path,
            r#"
[project]
id = "shop"
language = "flutter"
platforms = ["android", "web"]

[settings]
enable_security_scan = true
default_retry_count = 2
"#,
        )
        .unwrap();

        let file = load_config(Some(&path)).unwrap();
        let profile = resolve_profile(&ProjectArgs::default(), &file).unwrap();

        assert_eq!(profile.project_id, "shop");
        assert_eq!(profile.language, "flutter");
        assert_eq!(profile.platforms, vec![Platform::Android, Platform::Web]);
        assert!(profile.settings.enable_security_scan);
        assert_eq!(profile.settings.default_retry_count, 2);
        // Unset fields keep their defaults.
        assert!(profile.settings.parallel_tests);
    }

    #[test]
    fn flags_override_file_values() {
        let file = FileConfig {
            project: ProjectSection {
                id: Some("shop".into()),
                language: Some("flutter".into()),
                platforms: vec!["ios".into()],
            },
            settings: PipelineSettings::default(),
        };
        let mut flags = args("api", "rust");
        flags.platforms = vec!["server".into()];

        let profile = resolve_profile(&flags, &file).unwrap();
        assert_eq!(profile.project_id, "api");
        assert_eq!(profile.language, "rust");
        assert_eq!(profile.platforms, vec![Platform::Server]);
    }

    #[test]
    fn missing_language_is_an_error() {
        let flags = ProjectArgs {
            project: Some("shop".into()),
            ..ProjectArgs::default()
        };
        let err = resolve_profile(&flags, &FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("No language given"));
    }

    #[test]
    fn unreadable_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[project\nid = 1").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }

    #[test]
    fn generate_writes_configuration_json() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pipeline.json");
        let profile = resolve_profile(&args("shop", "go"), &FileConfig::default()).unwrap();

        cmd_generate(&profile, Some(&out)).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["project_id"], "shop");
        assert_eq!(written["version"], "1.0.0");
        assert!(written["stages"].as_array().unwrap().len() >= 6);
    }

    #[test]
    fn generate_rejects_blank_language() {
        let profile = resolve_profile(&args("shop", "  "), &FileConfig::default()).unwrap();
        assert!(cmd_generate(&profile, None).is_err());
    }

    #[tokio::test]
    async fn run_executes_echo_pipeline_locally() {
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let result = cmd_run(
            profile,
            "abc123",
            "main",
            "development",
            Actor::new("local", Role::Developer),
            None,
        )
        .await;
        assert!(result.is_ok(), "run failed: {:?}", result.err());
    }

    #[tokio::test]
    async fn gated_run_needs_an_approver() {
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let err = cmd_run(
            profile,
            "abc123",
            "main",
            "production",
            Actor::new("local", Role::Developer),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("requires approval"));
    }

    #[tokio::test]
    async fn approver_lets_gated_run_deploy() {
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let result = cmd_run(
            profile,
            "abc123",
            "main",
            "production",
            Actor::new("local", Role::Developer),
            Some(Actor::new("lee", Role::Lead)),
        )
        .await;
        assert!(result.is_ok(), "run failed: {:?}", result.err());
    }

    #[tokio::test]
    async fn self_approval_is_refused_up_front() {
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let err = cmd_run(
            profile,
            "abc123",
            "main",
            "production",
            Actor::new("lee", Role::Developer),
            Some(Actor::new("lee", Role::Lead)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[tokio::test]
    async fn viewer_cannot_run() {
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let result = cmd_run(
            profile,
            "abc123",
            "main",
            "development",
            Actor::new("val", Role::Viewer),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ignored_webhook_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(
            &path,
            r#"{"event":"release","action":"created","tag_name":"v1.0.0","actor":"ana"}"#,
        )
        .unwrap();
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        cmd_webhook(profile, &path).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_webhook_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"event":"deploy"}"#).unwrap();
        let profile = resolve_profile(&args("shop", "cobol"), &FileConfig::default()).unwrap();
        let err = cmd_webhook(profile, &path).await.unwrap_err();
        assert!(err.to_string().contains("Invalid event payload"));
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "shipline",
            "run",
            "--project",
            "shop",
            "--language",
            "flutter",
            "--platform",
            "android",
            "--platform",
            "web",
            "--environment",
            "staging",
            "--role",
            "lead",
            "--approver",
            "lee",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                project,
                environment,
                role,
                approver,
                ..
            } => {
                assert_eq!(project.platforms, vec!["android", "web"]);
                assert_eq!(environment, "staging");
                assert_eq!(role, Role::Lead);
                assert_eq!(approver.as_deref(), Some("lee"));
            }
            _ => panic!("expected run"),
        }
    }
}
