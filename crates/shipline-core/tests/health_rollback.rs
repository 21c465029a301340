//! Integration tests for health monitoring and rollback.

use std::sync::Arc;
use std::time::Duration;

use shipline_core::domain::events::topics;
use shipline_core::fakes::{
    MemoryAuditRecorder, MemoryEnvironmentCatalog, MemorySnapshotStore, MemorySourceControl,
    RecordingEventBus, ScriptedDeploymentExecutor, ScriptedHealthProbe, SourceControlCall,
};
use shipline_core::{
    Actor, AuditAction, DeploymentMonitor, DeploymentPolicy, DeploymentStatus,
    DeploymentStrategy, DeploymentTrigger, EnvironmentDefinition, HealthCheckSpec,
    MonitorLauncher, PollingOutcome, PollingPlan, Role, RollbackController,
    RollbackDisposition, RollbackError, RetryPolicy, Snapshot, SnapshotStore, StepOutcome,
};

struct World {
    trigger: Arc<DeploymentTrigger>,
    monitor: Arc<DeploymentMonitor>,
    rollback: Arc<RollbackController>,
    probe: Arc<ScriptedHealthProbe>,
    snapshots: Arc<MemorySnapshotStore>,
    scm: Arc<MemorySourceControl>,
    executor: Arc<ScriptedDeploymentExecutor>,
    audit: Arc<MemoryAuditRecorder>,
    events: Arc<RecordingEventBus>,
}

fn production() -> EnvironmentDefinition {
    let mut env =
        EnvironmentDefinition::new("production").requiring_approval(vec![Role::Lead, Role::Admin]);
    env.variables.insert("APP_ENV".into(), "production".into());
    env.health_checks = vec![
        HealthCheckSpec::http("health", "http://shop.example/health", 3).critical(),
        HealthCheckSpec::http("ready", "http://shop.example/ready", 3),
    ];
    env
}

fn world() -> World {
    let catalog = Arc::new(MemoryEnvironmentCatalog::new());
    catalog.insert_environment("shop", production());
    let probe = Arc::new(ScriptedHealthProbe::new(true));
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let scm = Arc::new(MemorySourceControl::new());
    let executor = Arc::new(ScriptedDeploymentExecutor::new());
    let audit = Arc::new(MemoryAuditRecorder::new());
    let events = Arc::new(RecordingEventBus::new());

    let trigger = Arc::new(DeploymentTrigger::new(
        catalog.clone(),
        executor.clone(),
        snapshots.clone(),
        audit.clone(),
        events.clone(),
    ));
    let rollback = Arc::new(
        RollbackController::new(
            trigger.clone(),
            snapshots.clone(),
            catalog,
            scm.clone(),
            executor.clone(),
            probe.clone(),
            audit.clone(),
            events.clone(),
        )
        .with_retry(RetryPolicy::new(3, 1)),
    );
    let monitor = Arc::new(
        DeploymentMonitor::new(probe.clone(), snapshots.clone(), audit.clone(), events.clone())
            .with_auto_rollback(rollback.clone()),
    );
    World {
        trigger,
        monitor,
        rollback,
        probe,
        snapshots,
        scm,
        executor,
        audit,
        events,
    }
}

async fn verified_snapshot(w: &World) -> Snapshot {
    let snap = Snapshot::new("shop", "production", "0123456789abcdef")
        .with_config_file("deploy/production.env", "APP_ENV=production\n")
        .verified();
    w.snapshots.save(snap.clone()).await.unwrap();
    snap
}

async fn deployed_request(w: &World) -> uuid::Uuid {
    let req = w
        .trigger
        .trigger_deployment("shop", "production", "fedcba9876543210", "release", &Actor::new("dana", Role::Developer))
        .await
        .unwrap();
    let done = w.trigger.approve(req.id, &Actor::new("lee", Role::Lead)).await.unwrap();
    assert_eq!(done.status, DeploymentStatus::Success);
    req.id
}

// ── Scenario: threshold crossing then rollback ──

#[tokio::test]
async fn three_failures_recommend_rollback_and_verified_snapshot_restores() {
    let w = world();
    let target = verified_snapshot(&w).await;
    let deployment_id = deployed_request(&w).await;

    w.probe.script("health", [false, false, false]);
    let session = w
        .monitor
        .start_session(deployment_id, "production", production().health_checks);

    assert!(!w.monitor.observe(session).await.unwrap().rollback_recommended);
    assert!(!w.monitor.observe(session).await.unwrap().rollback_recommended);
    let third = w.monitor.observe(session).await.unwrap();
    assert!(third.rollback_recommended);
    assert_eq!(third.newly_failing_check.as_deref(), Some("health"));
    assert_eq!(w.events.on_topic(topics::HEALTH).len(), 1);

    let result = w
        .rollback
        .rollback("production", target.id, "health check failing", &Actor::new("lee", Role::Lead))
        .await
        .unwrap();

    assert_eq!(result.rolled_back_request, Some(deployment_id));
    assert_eq!(
        w.trigger.get(deployment_id).unwrap().status,
        DeploymentStatus::RolledBack
    );
    assert_eq!(result.rollback_branch, "rollback/production/01234567");
    assert_eq!(w.executor.redeployed(), vec![target.commit_id.clone()]);
    assert!(result.steps.iter().all(|s| s.outcome == StepOutcome::Succeeded));
    assert_eq!(w.audit.count(AuditAction::RollbackStep), 3);
    assert_eq!(w.events.on_topic(topics::ROLLBACK).len(), 3);

    let calls = w.scm.calls();
    assert!(matches!(&calls[0], SourceControlCall::CreateBranch { branch, .. } if branch == "rollback/production/01234567"));
    assert!(matches!(&calls[1], SourceControlCall::CreateCommit { files, .. } if files.contains_key("deploy/production.env")));
}

#[tokio::test]
async fn interleaved_success_resets_counter() {
    let w = world();
    w.probe.script("ready", [false, false, true, false, false]);
    let session = w
        .monitor
        .start_session(uuid::Uuid::new_v4(), "production", production().health_checks);
    for _ in 0..5 {
        let o = w.monitor.observe(session).await.unwrap();
        assert!(!o.rollback_recommended);
    }
    let state = w.monitor.session(session).await.unwrap();
    assert_eq!(state.counter("ready"), Some(2));
}

// ── Target validation ──

#[tokio::test]
async fn unverified_snapshot_is_invalid_target_without_mutation() {
    let w = world();
    let deployment_id = deployed_request(&w).await;
    let unverified = Snapshot::new("shop", "production", "aaaaaaaaaaaa");
    w.snapshots.save(unverified.clone()).await.unwrap();

    let err = w
        .rollback
        .rollback("production", unverified.id, "try", &Actor::new("lee", Role::Lead))
        .await
        .unwrap_err();

    assert!(matches!(err, RollbackError::InvalidTarget(_)));
    assert_eq!(
        w.trigger.get(deployment_id).unwrap().status,
        DeploymentStatus::Success
    );
    assert!(w.scm.calls().is_empty());
    assert!(w.executor.redeployed().is_empty());
    assert_eq!(w.audit.count(AuditAction::RollbackStep), 0);
    assert_eq!(w.audit.count(AuditAction::RollbackRejected), 1);
}

#[tokio::test]
async fn snapshot_from_other_environment_is_invalid_target() {
    let w = world();
    let staging = Snapshot::new("shop", "staging", "bbbbbbbb").verified();
    w.snapshots.save(staging.clone()).await.unwrap();
    let err = w
        .rollback
        .rollback("production", staging.id, "", &Actor::new("lee", Role::Lead))
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::InvalidTarget(_)));
}

#[tokio::test]
async fn developer_cannot_roll_back_gated_environment() {
    let w = world();
    let target = verified_snapshot(&w).await;
    let err = w
        .rollback
        .rollback("production", target.id, "", &Actor::new("dana", Role::Developer))
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::InsufficientPermission { .. }));
}

// ── Rollback failures ──

#[tokio::test]
async fn failing_critical_check_after_redeploy_is_rollback_failed() {
    let w = world();
    let target = verified_snapshot(&w).await;
    w.probe.script("health", [false]);

    let err = w
        .rollback
        .rollback("production", target.id, "", &Actor::new("lee", Role::Lead))
        .await
        .unwrap_err();
    match err {
        RollbackError::RollbackFailed { step, .. } => assert_eq!(step, "verify_health"),
        other => panic!("unexpected error {other}"),
    }
    // Only the critical check is re-run.
    assert_eq!(w.probe.probed(), vec!["health".to_string()]);
    assert_eq!(w.executor.redeployed().len(), 1);
}

#[tokio::test]
async fn transient_source_control_errors_are_retried() {
    let w = world();
    let target = verified_snapshot(&w).await;
    w.scm.fail_transiently(2);
    let result = w
        .rollback
        .rollback("production", target.id, "", &Actor::new("ada", Role::Admin))
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 3);
}

#[tokio::test]
async fn redeploy_failure_is_not_retried() {
    let w = world();
    let target = verified_snapshot(&w).await;
    w.executor.push_redeploy(Err("cluster unreachable".into()));
    let err = w
        .rollback
        .rollback("production", target.id, "", &Actor::new("ada", Role::Admin))
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::RollbackFailed { ref step, .. } if step == "restore_and_redeploy"));
    assert_eq!(w.executor.redeployed().len(), 1);
}

// ── Automatic rollback ──

#[tokio::test(start_paused = true)]
async fn polling_triggers_automatic_rollback_when_policy_allows() {
    let w = world();
    let target = verified_snapshot(&w).await;
    let deployment_id = deployed_request(&w).await;

    w.probe.script("health", [false, false, false]);
    let session = w
        .monitor
        .start_session(deployment_id, "production", production().health_checks);
    let plan = PollingPlan {
        project_id: "shop".into(),
        interval: Duration::from_secs(30),
        window: Duration::from_secs(900),
        rollback_on_failure: true,
    };
    let outcome = w.monitor.spawn_polling(session, plan).await.unwrap().unwrap();

    match outcome {
        PollingOutcome::RollbackRecommended {
            failing_check,
            disposition: RollbackDisposition::Completed { .. },
        } => assert_eq!(failing_check.as_deref(), Some("health")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        w.trigger.get(deployment_id).unwrap().status,
        DeploymentStatus::RolledBack
    );
    assert_eq!(w.executor.redeployed(), vec![target.commit_id]);
}

#[tokio::test(start_paused = true)]
async fn launcher_monitors_successful_deployments() {
    let catalog = Arc::new(MemoryEnvironmentCatalog::new());
    let mut staging = EnvironmentDefinition::new("staging");
    staging.health_checks = vec![HealthCheckSpec::http("health", "http://stg/health", 2)];
    catalog.insert_environment("shop", staging);
    catalog.insert_policy(
        "shop",
        DeploymentPolicy {
            strategy: DeploymentStrategy::Rolling,
            rollback_on_failure: false,
            health_check_interval_secs: 10,
            monitoring_window_secs: 60,
            failure_threshold: 2,
        },
    );
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let probe = Arc::new(ScriptedHealthProbe::new(true));
    let audit = Arc::new(MemoryAuditRecorder::new());
    let events = Arc::new(RecordingEventBus::new());
    let monitor = Arc::new(DeploymentMonitor::new(
        probe,
        snapshots.clone(),
        audit.clone(),
        events.clone(),
    ));
    let launcher = Arc::new(MonitorLauncher::new(
        monitor.clone(),
        catalog.clone(),
        DeploymentPolicy {
            strategy: DeploymentStrategy::Rolling,
            rollback_on_failure: true,
            health_check_interval_secs: 30,
            monitoring_window_secs: 900,
            failure_threshold: 3,
        },
    ));
    let trigger = DeploymentTrigger::new(
        catalog,
        Arc::new(ScriptedDeploymentExecutor::new()),
        snapshots.clone(),
        audit.clone(),
        events,
    )
    .with_listener(launcher);

    let req = trigger
        .trigger_deployment("shop", "staging", "c0ffee00", "", &Actor::new("dana", Role::Developer))
        .await
        .unwrap();
    assert_eq!(audit.count(AuditAction::HealthSessionStarted), 1);

    // Let the window elapse.
    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    let session = monitor.session_for_deployment(req.id).await.unwrap();
    assert!(session.is_closed());
    let snap = snapshots.for_deployment(req.id).await.unwrap().unwrap();
    assert!(snap.verified);
}
