//! Automated test triggering for commits and pull requests.
//!
//! Enabled suites run as stages through the injected [`StageExecutor`], up
//! to `max_concurrent_suites` at a time when the policy allows parallelism.
//! Under fail-fast, the first failing required suite cancels every sibling:
//! queued suites never start and running ones are interrupted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use shipline_core::obs;
use shipline_core::{
    AuditAction, AuditEntry, AuditRecorder, EventBus, PipelineConfiguration, PipelineError,
    PipelineEvent, StageTemplate, SuiteResult, SuiteStatus, TestExecution, TestExecutionStatus,
    TestPolicy, TestSuite, TestTrigger,
};

use crate::config::ConfigurationRegistry;
use crate::gate::{GateVerdict, MergeGate};
use crate::runner::{StageContext, StageExecutor};

/// Environment name exported to suites run outside a pipeline.
pub const TEST_ENVIRONMENT: &str = "test";

struct TestRecord {
    execution: TestExecution,
    verdict: GateVerdict,
}

pub struct AutomatedTestTrigger {
    registry: Arc<ConfigurationRegistry>,
    executor: Arc<dyn StageExecutor>,
    audit: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventBus>,
    records: Mutex<Vec<TestRecord>>,
}

impl AutomatedTestTrigger {
    pub fn new(
        registry: Arc<ConfigurationRegistry>,
        executor: Arc<dyn StageExecutor>,
        audit: Arc<dyn AuditRecorder>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            registry,
            executor,
            audit,
            events,
            records: Mutex::new(Vec::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<TestRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the project's enabled suites against a pushed commit.
    pub async fn trigger_on_commit(
        &self,
        project_id: &str,
        commit_id: &str,
        branch: &str,
        author: &str,
    ) -> Result<TestExecution, PipelineError> {
        let config = self.registry.resolve(project_id).await?;
        let trigger = TestTrigger::Commit {
            commit_id: commit_id.to_string(),
            branch: branch.to_string(),
            author: author.to_string(),
        };
        let ctx = StageContext::new(project_id, commit_id, branch, TEST_ENVIRONMENT);
        Ok(self.run_suites(&config, trigger, ctx).await)
    }

    /// Run the project's enabled suites for a pull request and record its
    /// merge readiness.
    pub async fn trigger_on_pull_request(
        &self,
        project_id: &str,
        pr_id: u64,
        source_branch: &str,
        target_branch: &str,
        author: &str,
    ) -> Result<TestExecution, PipelineError> {
        let config = self.registry.resolve(project_id).await?;
        let trigger = TestTrigger::PullRequest {
            pr_id,
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            author: author.to_string(),
        };
        let ctx = StageContext::new(project_id, source_branch, source_branch, TEST_ENVIRONMENT)
            .with_variable("SHIPLINE_PR_ID", pr_id.to_string())
            .with_variable("SHIPLINE_TARGET_BRANCH", target_branch);
        Ok(self.run_suites(&config, trigger, ctx).await)
    }

    /// Run `config`'s test policy under `ctx` and record the execution.
    ///
    /// Also the entry point for a pipeline's test stage, which passes its
    /// own execution context.
    #[instrument(skip_all, fields(project_id = %config.project_id))]
    pub async fn run_suites(
        &self,
        config: &PipelineConfiguration,
        trigger: TestTrigger,
        ctx: StageContext,
    ) -> TestExecution {
        let policy = &config.test_policy;
        let mut execution = TestExecution::new(&config.project_id, trigger);

        self.audit.record(
            AuditEntry::new(
                AuditAction::TestsTriggered,
                format!("tests triggered on {}", execution.trigger.branch()),
            )
            .project(&config.project_id)
            .subject(execution.id)
            .context(json!({
                "trigger": execution.trigger,
                "suites": policy.enabled_suites().map(|s| s.name.clone()).collect::<Vec<_>>(),
                "parallel": policy.parallel_execution,
                "fail_fast": policy.fail_fast,
            })),
        );
        self.progress(&execution, None, None);

        let mut results = schedule(
            policy,
            execution.id,
            &config.project_id,
            Arc::clone(&self.executor),
            Arc::clone(&self.events),
            ctx,
        )
        .await;
        results.extend(policy.suites.iter().filter(|s| !s.enabled).map(skipped));

        execution.suites = results;
        execution.status = execution.resolve_status();
        execution.completed_at = Some(Utc::now());

        let verdict = MergeGate::evaluate(&execution, policy);
        execution.merge_ready = execution.trigger.pr_id().is_some() && verdict.passed;

        info!(
            test_execution_id = %execution.id,
            status = ?execution.status,
            passed = execution.passed_count(),
            failed = execution.failed_count(),
            "test execution finished"
        );
        obs::emit_tests_finished(
            execution.id,
            execution.passed_count(),
            execution.failed_count(),
            execution.merge_ready,
        );
        self.progress(&execution, None, None);

        self.records().push(TestRecord {
            execution: execution.clone(),
            verdict,
        });
        execution
    }

    pub fn get(&self, test_execution_id: Uuid) -> Option<TestExecution> {
        self.records()
            .iter()
            .find(|r| r.execution.id == test_execution_id)
            .map(|r| r.execution.clone())
    }

    /// Gate verdict of the latest test run for a pull request.
    pub fn merge_readiness(&self, project_id: &str, pr_id: u64) -> Option<GateVerdict> {
        self.records()
            .iter()
            .rev()
            .find(|r| {
                r.execution.project_id == project_id && r.execution.trigger.pr_id() == Some(pr_id)
            })
            .map(|r| r.verdict.clone())
    }

    fn progress(&self, execution: &TestExecution, suite: Option<String>, status: Option<SuiteStatus>) {
        self.events.broadcast(PipelineEvent::TestProgress {
            test_execution_id: execution.id,
            project_id: execution.project_id.clone(),
            suite,
            suite_status: status,
            status: execution.status,
            at: Utc::now(),
        });
    }
}

fn skipped(suite: &TestSuite) -> SuiteResult {
    SuiteResult {
        suite: suite.name.clone(),
        kind: suite.kind,
        optional: suite.optional,
        status: SuiteStatus::Skipped,
        output: String::new(),
        error: None,
        duration_ms: 0,
    }
}

/// Run every enabled suite, returning results in policy order.
async fn schedule(
    policy: &TestPolicy,
    test_execution_id: Uuid,
    project_id: &str,
    executor: Arc<dyn StageExecutor>,
    events: Arc<dyn EventBus>,
    ctx: StageContext,
) -> Vec<SuiteResult> {
    let concurrency = if policy.parallel_execution {
        policy.max_concurrent_suites.max(1)
    } else {
        1
    };
    let sem = Arc::new(Semaphore::new(concurrency));
    let (fail_tx, _fail_rx) = watch::channel(false);
    let fail_flag = Arc::new(fail_tx);

    let suites: Vec<TestSuite> = policy.enabled_suites().cloned().collect();
    let mut tasks = Vec::with_capacity(suites.len());

    for suite in suites.iter().cloned() {
        let sem = Arc::clone(&sem);
        let executor = Arc::clone(&executor);
        let events = Arc::clone(&events);
        let fail_flag = Arc::clone(&fail_flag);
        let mut fail_rx = fail_flag.subscribe();
        let ctx = ctx.clone();
        let project_id = project_id.to_string();
        let fail_fast = policy.fail_fast;

        tasks.push(tokio::spawn(async move {
            let notify = |status: SuiteStatus| {
                events.broadcast(PipelineEvent::TestProgress {
                    test_execution_id,
                    project_id: project_id.clone(),
                    suite: Some(suite.name.clone()),
                    suite_status: Some(status),
                    status: TestExecutionStatus::Running,
                    at: Utc::now(),
                });
            };

            let _permit = sem.acquire_owned().await.ok();

            // Abort early if fail_fast was triggered by a sibling.
            if *fail_rx.borrow() {
                notify(SuiteStatus::Cancelled);
                return cancelled(&suite, 0);
            }

            notify(SuiteStatus::Running);
            let start = Instant::now();
            let template =
                StageTemplate::custom(&suite.name, suite.commands.clone(), suite.timeout_secs);

            let interrupted = async {
                let tripped = fail_rx.wait_for(|failed| *failed).await.is_ok();
                if !tripped {
                    std::future::pending::<()>().await;
                }
            };

            let result = tokio::select! {
                result = executor.execute(&template, &ctx) => result,
                _ = interrupted => {
                    notify(SuiteStatus::Cancelled);
                    return cancelled(&suite, start.elapsed().as_millis() as u64);
                }
            };

            let status = if result.success {
                SuiteStatus::Passed
            } else {
                if fail_fast && !suite.optional {
                    warn!(suite = %suite.name, "required suite failed, cancelling siblings");
                    let _ = fail_flag.send(true);
                }
                SuiteStatus::Failed
            };
            notify(status);

            SuiteResult {
                suite: suite.name.clone(),
                kind: suite.kind,
                optional: suite.optional,
                status,
                output: result.output.clone(),
                error: result.error_message(),
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }));
    }

    let joined = futures::future::join_all(tasks).await;
    joined
        .into_iter()
        .zip(suites)
        .map(|(joined, suite)| match joined {
            Ok(result) => result,
            Err(err) => SuiteResult {
                suite: suite.name.clone(),
                kind: suite.kind,
                optional: suite.optional,
                status: SuiteStatus::Failed,
                output: String::new(),
                error: Some(format!("suite task aborted: {err}")),
                duration_ms: 0,
            },
        })
        .collect()
}

fn cancelled(suite: &TestSuite, duration_ms: u64) -> SuiteResult {
    SuiteResult {
        suite: suite.name.clone(),
        kind: suite.kind,
        optional: suite.optional,
        status: SuiteStatus::Cancelled,
        output: String::new(),
        error: Some("cancelled by fail-fast".to_string()),
        duration_ms,
    }
}
