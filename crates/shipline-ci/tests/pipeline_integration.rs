//! Integration tests for pipeline orchestration with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use shipline_ci::fakes::ScriptedStageExecutor;
use shipline_ci::{
    AutomatedTestTrigger, CommandStageExecutor, ConfigurationGenerator, ConfigurationRegistry,
    PipelineOrchestrator, StageExecutor, WebhookDispatch, WebhookEvent, WebhookRouter,
};
use shipline_core::domain::events::topics;
use shipline_core::fakes::{
    MemoryAuditRecorder, MemoryExecutionHistory, MemoryProjectStore, MemorySnapshotStore,
    RecordingEventBus, ScriptedDeploymentExecutor,
};
use shipline_core::{
    Actor, AuditAction, DeploymentDispatcher, DeploymentRequest, DeploymentStatus,
    DeploymentTrigger, PipelineEvent,
    PipelineExecution, PipelineSettings, PipelineStatus, PipelineTrigger, Platform,
    ProjectProfile, Role, StageKind, StageStatus, TestExecutionStatus,
};

struct Harness {
    orchestrator: Arc<PipelineOrchestrator>,
    registry: Arc<ConfigurationRegistry>,
    tests: Arc<AutomatedTestTrigger>,
    deployments: Arc<DeploymentTrigger>,
    deployer: Arc<ScriptedDeploymentExecutor>,
    exec: Arc<ScriptedStageExecutor>,
    audit: Arc<MemoryAuditRecorder>,
    events: Arc<RecordingEventBus>,
}

fn harness(settings: PipelineSettings) -> Harness {
    let exec = Arc::new(ScriptedStageExecutor::new());
    wire(settings, exec.clone(), exec)
}

fn wire(
    settings: PipelineSettings,
    stage_executor: Arc<dyn StageExecutor>,
    exec: Arc<ScriptedStageExecutor>,
) -> Harness {
    let audit = Arc::new(MemoryAuditRecorder::new());
    let events = Arc::new(RecordingEventBus::new());
    let projects = Arc::new(MemoryProjectStore::new());
    projects.insert(ProjectProfile {
        project_id: "shop".into(),
        language: "flutter".into(),
        platforms: vec![Platform::Android, Platform::Web],
        settings,
    });
    let registry = Arc::new(ConfigurationRegistry::new(
        ConfigurationGenerator::new(audit.clone()),
        projects,
    ));

    let tests = Arc::new(AutomatedTestTrigger::new(
        registry.clone(),
        stage_executor.clone(),
        audit.clone(),
        events.clone(),
    ));
    let deployer = Arc::new(ScriptedDeploymentExecutor::new());
    let deployments = Arc::new(DeploymentTrigger::new(
        registry.clone(),
        deployer.clone(),
        Arc::new(MemorySnapshotStore::new()),
        audit.clone(),
        events.clone(),
    ));
    let (dispatcher, _task) = DeploymentDispatcher::spawn(deployments.clone(), 16);

    let orchestrator = PipelineOrchestrator::new(
        registry.clone(),
        stage_executor,
        Arc::new(MemoryExecutionHistory::new()),
        audit.clone(),
        events.clone(),
    )
    .with_test_trigger(tests.clone())
    .with_dispatcher(dispatcher);

    Harness {
        orchestrator: Arc::new(orchestrator),
        registry,
        tests,
        deployments,
        deployer,
        exec,
        audit,
        events,
    }
}

fn push(branch: &str) -> WebhookEvent {
    WebhookEvent::Push {
        commit_id: "9f8e7d6c5b4a".into(),
        branch: branch.into(),
        actor: "dana".into(),
    }
}

fn trigger(environment: &str) -> PipelineTrigger {
    PipelineTrigger::new(
        "shop",
        "9f8e7d6c5b4a",
        "main",
        Actor::new("dana", Role::Developer),
        environment,
    )
}

fn status_of(run: &PipelineExecution, kind: StageKind) -> StageStatus {
    run.stages
        .iter()
        .find(|s| s.kind == kind)
        .map(|s| s.status)
        .unwrap_or_else(|| panic!("no {kind:?} stage"))
}

// ── End-to-end scenarios ──

#[tokio::test(start_paused = true)]
async fn push_with_parallel_suites_reaches_deploy() {
    let h = harness(PipelineSettings::default());

    // Enable all three suites so they run side by side.
    let mut config = (*h.registry.resolve("shop").await.unwrap()).clone();
    for suite in &mut config.test_policy.suites {
        suite.enabled = true;
        suite.optional = false;
    }
    h.registry.install(config);
    for suite in ["unit", "integration", "e2e"] {
        h.exec.delay(suite, Duration::from_secs(1));
    }

    let router = WebhookRouter::new().unwrap();
    let dispatch = router
        .dispatch("shop", &push("refs/heads/main"), &h.orchestrator, &h.tests)
        .await
        .unwrap();
    let WebhookDispatch::Started(handle) = dispatch else {
        panic!("push should start a pipeline");
    };
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, PipelineStatus::Success);
    assert_eq!(run.environment, "development");
    assert_eq!(status_of(&run, StageKind::Test), StageStatus::Success);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Success);
    assert_eq!(h.exec.max_in_flight(), 3);

    let test_output = &run.stage("test").unwrap().output;
    assert_eq!(test_output.matches("Passed").count(), 3);

    assert_eq!(h.deployer.deployed().len(), 1);
    let history = h.deployments.get_deployment_history(Some("development"), 10);
    assert_eq!(history[0].status, DeploymentStatus::Success);
    assert_eq!(history[0].execution_id, Some(run.id));
}

#[tokio::test]
async fn build_failure_skips_everything_after_it() {
    let h = harness(PipelineSettings::default());
    h.exec.fail("build", 1);

    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    assert_eq!(run.status, PipelineStatus::Failed);
    assert!(run.completed_at.is_some());
    assert!(run.error.as_deref().unwrap().contains("build"));
    assert_eq!(status_of(&run, StageKind::Build), StageStatus::Failed);
    for kind in [
        StageKind::Test,
        StageKind::Package,
        StageKind::Deploy,
        StageKind::PostDeployTest,
        StageKind::MonitorSetup,
    ] {
        assert_eq!(status_of(&run, kind), StageStatus::Skipped, "{kind:?}");
    }
    assert_eq!(h.exec.executed_names(), vec!["setup", "code_quality", "build"]);
    assert!(h.deployer.deployed().is_empty());
}

/// Wait for the deployment request an execution parked behind approval.
async fn parked_request(h: &Harness, execution_id: Uuid) -> DeploymentRequest {
    loop {
        let parked = h
            .deployments
            .get_pending_approvals(Some("production"))
            .into_iter()
            .find(|r| r.execution_id == Some(execution_id));
        if let Some(request) = parked {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn production_deploy_waits_for_approval() {
    let h = harness(PipelineSettings::default());

    let handle = h.orchestrator.start(trigger("production")).await.unwrap();
    let request = parked_request(&h, handle.execution_id()).await;
    assert!(h.deployer.deployed().is_empty());
    let config = h.registry.current("shop").unwrap();
    assert_eq!(request.configuration_id, Some(config.id));

    // Still running, with the deploy stage open, while the request waits.
    let waiting = h.orchestrator.get(handle.execution_id()).await.unwrap();
    assert_eq!(waiting.status, PipelineStatus::Running);
    assert_eq!(status_of(&waiting, StageKind::Deploy), StageStatus::Running);
    assert_eq!(status_of(&waiting, StageKind::PostDeployTest), StageStatus::Pending);

    h.deployments
        .approve(request.id, &Actor::new("lee", Role::Lead))
        .await
        .unwrap();
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, PipelineStatus::Success);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Success);
    assert_eq!(status_of(&run, StageKind::PostDeployTest), StageStatus::Success);
    assert_eq!(status_of(&run, StageKind::MonitorSetup), StageStatus::Success);
    assert_eq!(h.deployer.deployed(), vec![request.id]);
    assert_eq!(
        h.deployments.get(request.id).unwrap().status,
        DeploymentStatus::Success
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_production_deploy_fails_the_pipeline() {
    let h = harness(PipelineSettings::default());

    let handle = h.orchestrator.start(trigger("production")).await.unwrap();
    let request = parked_request(&h, handle.execution_id()).await;
    h.deployments
        .reject(request.id, &Actor::new("lee", Role::Lead), "release freeze")
        .await
        .unwrap();
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Failed);
    let error = run.stage("deploy").unwrap().error.clone().unwrap();
    assert_eq!(error, "deployment rejected by lee: release freeze");
    assert_eq!(status_of(&run, StageKind::PostDeployTest), StageStatus::Skipped);
    assert!(h.deployer.deployed().is_empty());
}

#[tokio::test]
async fn failed_deployment_fails_the_pipeline() {
    let h = harness(PipelineSettings::default());
    h.deployer.push_deploy(Err("cluster unreachable".into()));

    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Failed);
    assert!(run
        .stage("deploy")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("cluster unreachable"));
    assert_eq!(status_of(&run, StageKind::PostDeployTest), StageStatus::Skipped);
}

// ── Ordering and failure policy ──

#[tokio::test]
async fn stage_events_follow_configuration_order() {
    let h = harness(PipelineSettings::default());
    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    let progress: Vec<(usize, StageStatus)> = h
        .events
        .on_topic(topics::STAGE_PROGRESS)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::StageProgress { index, status, execution_id, .. } if execution_id == run.id => {
                Some((index, status))
            }
            _ => None,
        })
        .collect();

    let mut expected = Vec::new();
    for index in 0..run.stages.len() {
        expected.push((index, StageStatus::Running));
        expected.push((index, StageStatus::Success));
    }
    assert_eq!(progress, expected);

    let statuses: Vec<PipelineStatus> = h
        .events
        .on_topic(topics::PIPELINE_STATUS)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::PipelineStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![PipelineStatus::Running, PipelineStatus::Success]);
}

#[tokio::test]
async fn continue_on_error_stage_does_not_halt() {
    let h = harness(PipelineSettings::default());
    let mut config = (*h.registry.resolve("shop").await.unwrap()).clone();
    for stage in &mut config.stages {
        if stage.kind == StageKind::CodeQuality {
            stage.continue_on_error = true;
        }
        if stage.kind == StageKind::Package {
            stage.enabled = false;
        }
    }
    h.registry.install(config);
    h.exec.fail("code_quality", 1);

    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    assert_eq!(run.status, PipelineStatus::Success);
    assert_eq!(status_of(&run, StageKind::CodeQuality), StageStatus::Failed);
    assert_eq!(status_of(&run, StageKind::Build), StageStatus::Success);
    assert_eq!(status_of(&run, StageKind::Package), StageStatus::Skipped);
    assert!(!h.exec.executed_names().contains(&"package".to_string()));
}

#[tokio::test]
async fn failing_required_suite_fails_test_stage() {
    let h = harness(PipelineSettings::default());
    h.exec.fail("integration", 1);

    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(status_of(&run, StageKind::Test), StageStatus::Failed);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Skipped);
}

// ── Cancellation ──

#[tokio::test(start_paused = true)]
async fn cancellation_takes_effect_at_next_stage_boundary() {
    let h = harness(PipelineSettings::default());
    h.exec.delay("build", Duration::from_secs(30));

    let handle = h.orchestrator.start(trigger("development")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.exec.executed_names().last().map(String::as_str), Some("build"));

    h.orchestrator
        .cancel(handle.execution_id(), &Actor::new("lee", Role::Lead))
        .await
        .unwrap();
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, PipelineStatus::Cancelled);
    // The running stage was allowed to finish.
    assert_eq!(status_of(&run, StageKind::Build), StageStatus::Success);
    assert_eq!(status_of(&run, StageKind::Test), StageStatus::Skipped);
    assert_eq!(status_of(&run, StageKind::Deploy), StageStatus::Skipped);
    assert_eq!(h.audit.count(AuditAction::PipelineCancelled), 1);

    let stored = h.orchestrator.get(run.id).await.unwrap();
    assert_eq!(stored.status, PipelineStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn viewer_cannot_cancel() {
    let h = harness(PipelineSettings::default());
    h.exec.delay("setup", Duration::from_secs(5));
    let handle = h.orchestrator.start(trigger("development")).await.unwrap();

    let err = h
        .orchestrator
        .cancel(handle.execution_id(), &Actor::new("val", Role::Viewer))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("may not cancel"));

    let run = handle.wait().await.unwrap();
    assert_eq!(run.status, PipelineStatus::Success);
}

// ── Webhooks and history ──

#[tokio::test]
async fn pull_request_runs_tests_without_pipeline() {
    let h = harness(PipelineSettings::default());
    let router = WebhookRouter::new().unwrap();
    let event = WebhookEvent::PullRequest {
        action: "opened".into(),
        pr_id: 42,
        source_branch: "feature/cart".into(),
        target_branch: "main".into(),
        actor: "dana".into(),
    };

    let dispatch = router
        .dispatch("shop", &event, &h.orchestrator, &h.tests)
        .await
        .unwrap();
    let WebhookDispatch::Tested(run) = dispatch else {
        panic!("pull request should only run tests");
    };

    assert_eq!(run.status, TestExecutionStatus::Passed);
    assert!(run.merge_ready);
    assert!(h.tests.merge_readiness("shop", 42).unwrap().passed);
    assert!(h.orchestrator.history("shop").await.unwrap().is_empty());
    assert!(!h.exec.executed_names().contains(&"deploy".to_string()));
}

#[tokio::test]
async fn history_is_append_only_per_project() {
    let h = harness(PipelineSettings::default());
    h.exec.fail("setup", 1);
    let first = h.orchestrator.run(trigger("development")).await.unwrap();
    let second = h.orchestrator.run(trigger("development")).await.unwrap();

    let history = h.orchestrator.history("shop").await.unwrap();
    let ids: Vec<_> = history.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(history[0].status, PipelineStatus::Failed);
    assert_eq!(history[1].status, PipelineStatus::Success);
    assert_eq!(h.audit.count(AuditAction::PipelineStarted), 2);
    assert_eq!(h.audit.count(AuditAction::PipelineFinished), 2);
}

#[tokio::test]
async fn unknown_language_pipeline_runs_real_commands() {
    let exec = Arc::new(ScriptedStageExecutor::new());
    let h = wire(
        PipelineSettings::default(),
        Arc::new(CommandStageExecutor::new()),
        exec,
    );
    let config = ConfigurationGenerator::new(h.audit.clone())
        .generate("shop", "cobol", &[], &PipelineSettings::default())
        .unwrap();
    h.registry.install(config);

    let run = h.orchestrator.run(trigger("development")).await.unwrap();

    assert_eq!(run.status, PipelineStatus::Success, "{:?}", run.error);
    assert!(run.stage("build").unwrap().output.contains("no cobol template"));
}
