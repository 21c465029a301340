//! Pipeline orchestration.
//!
//! One [`PipelineExecution`] per trigger, driven stage by stage in the order
//! fixed by its configuration. The orchestrator is the single writer of each
//! execution: every transition is persisted to [`ExecutionHistory`] and
//! broadcast before the next one happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use shipline_core::metrics::METRICS;
use shipline_core::obs;
use shipline_core::{
    retry_with_backoff, Actor, AuditAction, AuditEntry, AuditRecorder, DeployOutcome,
    DeploymentDispatcher, EventBus, ExecutionHistory, PipelineConfiguration, PipelineError,
    PipelineEvent, PipelineExecution, PipelineStatus, PipelineTrigger, RetryPolicy,
    SourceControlProvider, StageKind, StageStatus, StageTemplate, StorageError,
    TestExecutionStatus, TestTrigger,
};

use crate::config::ConfigurationRegistry;
use crate::runner::{StageContext, StageExecutor};
use crate::test_trigger::AutomatedTestTrigger;

/// Label attached to issues filed for failed executions.
pub const FAILURE_ISSUE_LABEL: &str = "pipeline-failure";

/// Terminal status, error and first index left to skip.
type Terminal = (PipelineStatus, Option<String>, usize);

/// Terminal state of one stage as seen by the orchestrator.
struct StageOutcome {
    status: StageStatus,
    output: String,
    error: Option<String>,
    attempts: u32,
}

impl StageOutcome {
    fn success(output: String) -> Self {
        Self {
            status: StageStatus::Success,
            output,
            error: None,
            attempts: 1,
        }
    }

    fn failed(output: String, error: String) -> Self {
        Self {
            status: StageStatus::Failed,
            output,
            error: Some(error),
            attempts: 1,
        }
    }
}

/// A spawned execution.
pub struct ExecutionHandle {
    execution_id: Uuid,
    handle: JoinHandle<Result<PipelineExecution, PipelineError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Wait for the execution to reach a terminal status.
    pub async fn wait(self) -> Result<PipelineExecution, PipelineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(PipelineError::Aborted {
                execution_id: self.execution_id,
                reason: err.to_string(),
            }),
        }
    }
}

/// Pipeline orchestrator.
pub struct PipelineOrchestrator {
    registry: Arc<ConfigurationRegistry>,
    executor: Arc<dyn StageExecutor>,
    history: Arc<dyn ExecutionHistory>,
    audit: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventBus>,
    tests: Option<Arc<AutomatedTestTrigger>>,
    dispatcher: Option<DeploymentDispatcher>,
    source_control: Option<Arc<dyn SourceControlProvider>>,
    issue_retry: RetryPolicy,
    cancellations: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: Arc<ConfigurationRegistry>,
        executor: Arc<dyn StageExecutor>,
        history: Arc<dyn ExecutionHistory>,
        audit: Arc<dyn AuditRecorder>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            registry,
            executor,
            history,
            audit,
            events,
            tests: None,
            dispatcher: None,
            source_control: None,
            issue_retry: RetryPolicy::default(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Delegate test stages to the automated test trigger.
    pub fn with_test_trigger(mut self, tests: Arc<AutomatedTestTrigger>) -> Self {
        self.tests = Some(tests);
        self
    }

    /// Hand deploy stages to the deployment dispatcher instead of running
    /// their commands.
    pub fn with_dispatcher(mut self, dispatcher: DeploymentDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Provider used to file issues for failed executions.
    pub fn with_source_control(mut self, source_control: Arc<dyn SourceControlProvider>) -> Self {
        self.source_control = Some(source_control);
        self
    }

    pub fn with_issue_retry(mut self, retry: RetryPolicy) -> Self {
        self.issue_retry = retry;
        self
    }

    fn cancellations(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AtomicBool>>> {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Accept `trigger` and drive the execution in a background task.
    ///
    /// Resolution and permission errors are returned here; stage failures
    /// end up on the execution record.
    pub async fn start(self: &Arc<Self>, trigger: PipelineTrigger) -> Result<ExecutionHandle, PipelineError> {
        let (execution, config, cancel) = self.accept(trigger).await?;
        let execution_id = execution.id;
        let this = Arc::clone(self);
        let handle = tokio::spawn(
            async move { this.drive(execution, config, cancel).await }
                .instrument(obs::execution_span(execution_id)),
        );
        Ok(ExecutionHandle {
            execution_id,
            handle,
        })
    }

    /// Accept `trigger` and drive the execution to completion.
    pub async fn run(&self, trigger: PipelineTrigger) -> Result<PipelineExecution, PipelineError> {
        let (execution, config, cancel) = self.accept(trigger).await?;
        let span = obs::execution_span(execution.id);
        self.drive(execution, config, cancel).instrument(span).await
    }

    /// Request cancellation. Takes effect at the next stage boundary: the
    /// running stage finishes, no further stage starts.
    pub async fn cancel(&self, execution_id: Uuid, actor: &Actor) -> Result<(), PipelineError> {
        if !actor.role.can_cancel() {
            self.deny(actor, "cancel pipelines", Some(execution_id));
            return Err(PipelineError::InsufficientPermission {
                actor: actor.to_string(),
                action: "cancel pipelines".to_string(),
            });
        }

        let flag = self.cancellations().get(&execution_id).cloned();
        match flag {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(%execution_id, actor = %actor, "cancellation requested");
                self.audit.record(
                    AuditEntry::new(AuditAction::PipelineCancelled, "cancellation requested")
                        .actor(actor.name.clone())
                        .subject(execution_id),
                );
                Ok(())
            }
            None => match self.history.get(execution_id).await {
                Ok(_) => Err(PipelineError::NotRunning(execution_id)),
                Err(StorageError::NotFound(_)) => Err(PipelineError::ExecutionNotFound(execution_id)),
                Err(err) => Err(err.into()),
            },
        }
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<PipelineExecution, PipelineError> {
        match self.history.get(execution_id).await {
            Ok(execution) => Ok(execution),
            Err(StorageError::NotFound(_)) => Err(PipelineError::ExecutionNotFound(execution_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Executions of `project_id`, oldest first.
    pub async fn history(&self, project_id: &str) -> Result<Vec<PipelineExecution>, PipelineError> {
        Ok(self.history.list(project_id).await?)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn accept(
        &self,
        trigger: PipelineTrigger,
    ) -> Result<(PipelineExecution, Arc<PipelineConfiguration>, Arc<AtomicBool>), PipelineError> {
        if !trigger.actor.role.can_trigger() {
            self.deny(&trigger.actor, "trigger pipelines", None);
            return Err(PipelineError::InsufficientPermission {
                actor: trigger.actor.to_string(),
                action: "trigger pipelines".to_string(),
            });
        }

        let config = self.registry.resolve(&trigger.project_id).await?;
        let execution = PipelineExecution::new(trigger, &config);
        self.history.append(&execution).await?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancellations()
            .insert(execution.id, Arc::clone(&cancel));

        METRICS.inc_pipelines_started();
        obs::emit_pipeline_started(
            execution.id,
            &execution.project_id,
            &execution.commit_id,
            &execution.branch,
        );
        self.audit.record(
            AuditEntry::new(
                AuditAction::PipelineStarted,
                format!("pipeline started on {}@{}", execution.branch, execution.commit_id),
            )
            .actor(execution.triggered_by.name.clone())
            .project(&execution.project_id)
            .subject(execution.id)
            .context(json!({
                "configuration_id": config.id,
                "configuration_version": config.version,
                "environment": execution.environment,
                "stages": config.stage_names(),
            })),
        );
        self.status_event(&execution);
        Ok((execution, config, cancel))
    }

    async fn drive(
        &self,
        execution: PipelineExecution,
        config: Arc<PipelineConfiguration>,
        cancel: Arc<AtomicBool>,
    ) -> Result<PipelineExecution, PipelineError> {
        let execution_id = execution.id;
        let result = self.drive_stages(execution, &config, &cancel).await;
        self.cancellations().remove(&execution_id);
        result
    }

    /// Run the stages and close the execution.
    ///
    /// A history write failing mid-run still closes the execution: it is
    /// marked failed, one last write is attempted, the finish audit and
    /// status event go out, and the storage error is returned.
    async fn drive_stages(
        &self,
        mut execution: PipelineExecution,
        config: &PipelineConfiguration,
        cancel: &AtomicBool,
    ) -> Result<PipelineExecution, PipelineError> {
        let settled = match self.advance(&mut execution, config, cancel).await {
            Ok(terminal) => self.settle(&mut execution, terminal).await,
            Err(err) => Err(err),
        };
        if let Err(err) = settled {
            self.abandon(&mut execution, &err).await;
            self.finish(&execution, config).await;
            return Err(err);
        }
        self.finish(&execution, config).await;
        Ok(execution)
    }

    async fn advance(
        &self,
        execution: &mut PipelineExecution,
        config: &PipelineConfiguration,
        cancel: &AtomicBool,
    ) -> Result<Terminal, PipelineError> {
        for (index, template) in config.stages.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Ok((
                    PipelineStatus::Cancelled,
                    Some("cancelled before stage start".to_string()),
                    index,
                ));
            }

            if !template.enabled {
                info!(stage = %template.name, "Skipping disabled stage");
                execution.skip_stage(index, Some("stage disabled".to_string()));
                self.stage_event(execution, index).await?;
                continue;
            }

            if !execution.start_stage(index) {
                warn!(stage = %template.name, "stage refused to start");
                continue;
            }
            self.stage_event(execution, index).await?;

            let outcome = self.run_stage(execution, config, template).await;
            let failed = outcome.status == StageStatus::Failed;
            let error = outcome.error.clone();
            execution.finish_stage(
                index,
                outcome.status,
                outcome.output,
                outcome.error,
                outcome.attempts,
            );
            self.stage_event(execution, index).await?;

            if failed && !template.continue_on_error {
                let reason = format!(
                    "stage {} failed: {}",
                    template.name,
                    error.unwrap_or_else(|| "unknown error".to_string())
                );
                return Ok((PipelineStatus::Failed, Some(reason), index + 1));
            }
            if failed {
                warn!(stage = %template.name, "stage failed; continuing");
            }
        }
        Ok((PipelineStatus::Success, None, config.stages.len()))
    }

    async fn settle(
        &self,
        execution: &mut PipelineExecution,
        (status, error, skip_from): Terminal,
    ) -> Result<(), PipelineError> {
        for index in execution.skip_remaining(skip_from) {
            self.stage_event(execution, index).await?;
        }
        execution.complete(status, error);
        self.history.update(execution).await?;
        Ok(())
    }

    /// Close an execution whose history could not be written. Open stages
    /// are failed, pending ones skipped.
    async fn abandon(&self, execution: &mut PipelineExecution, err: &PipelineError) {
        warn!(error = %err, "execution history write failed; failing execution");
        let reason = format!("execution history unavailable: {err}");

        let mut changed = Vec::new();
        for index in 0..execution.stages.len() {
            let stage = &execution.stages[index];
            if stage.status != StageStatus::Running {
                continue;
            }
            let (output, attempts) = (stage.output.clone(), stage.attempts.max(1));
            execution.finish_stage(index, StageStatus::Failed, output, Some(reason.clone()), attempts);
            changed.push(index);
        }
        changed.extend(execution.skip_remaining(0));
        execution.complete(PipelineStatus::Failed, Some(reason));

        for index in changed {
            self.broadcast_stage(execution, index);
        }
        if let Err(err) = self.history.update(execution).await {
            warn!(error = %err, "final execution update failed");
        }
    }

    async fn run_stage(
        &self,
        execution: &PipelineExecution,
        config: &PipelineConfiguration,
        template: &StageTemplate,
    ) -> StageOutcome {
        match template.kind {
            StageKind::Test => {
                if let Some(tests) = &self.tests {
                    if config.test_policy.enabled_suites().next().is_some() {
                        return self.run_tests(tests, execution, config).await;
                    }
                }
            }
            StageKind::Deploy => {
                if let Some(dispatcher) = &self.dispatcher {
                    return deploy(dispatcher, execution, config).await;
                }
            }
            _ => {}
        }

        let mut ctx = StageContext::for_execution(execution);
        if let Some(env) = config.environment(&execution.environment) {
            for (key, value) in &env.variables {
                ctx.variables.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        let result = self.executor.execute(template, &ctx).await;
        StageOutcome {
            status: if result.success {
                StageStatus::Success
            } else {
                StageStatus::Failed
            },
            error: result.error_message(),
            output: result.output,
            attempts: result.attempts,
        }
    }

    async fn run_tests(
        &self,
        tests: &AutomatedTestTrigger,
        execution: &PipelineExecution,
        config: &PipelineConfiguration,
    ) -> StageOutcome {
        let trigger = TestTrigger::Commit {
            commit_id: execution.commit_id.clone(),
            branch: execution.branch.clone(),
            author: execution.triggered_by.name.clone(),
        };
        let run = tests
            .run_suites(config, trigger, StageContext::for_execution(execution))
            .await;

        let mut output = format!("test execution {}\n", run.id);
        for suite in &run.suites {
            output.push_str(&format!("{}: {:?}\n", suite.suite, suite.status));
        }
        if run.status == TestExecutionStatus::Passed {
            StageOutcome::success(output)
        } else {
            let error = format!(
                "{} of {} suites failed ({:?})",
                run.failed_count(),
                run.suites.len(),
                run.status
            );
            StageOutcome::failed(output, error)
        }
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Persist, log and broadcast the current state of stage `index`.
    async fn stage_event(&self, execution: &PipelineExecution, index: usize) -> Result<(), PipelineError> {
        self.history.update(execution).await?;
        self.broadcast_stage(execution, index);
        Ok(())
    }

    fn broadcast_stage(&self, execution: &PipelineExecution, index: usize) {
        if let Some(stage) = execution.stages.get(index) {
            obs::emit_stage_transition(execution.id, &stage.name, index, stage.status);
            self.events.broadcast(PipelineEvent::StageProgress {
                execution_id: execution.id,
                project_id: execution.project_id.clone(),
                stage: stage.name.clone(),
                index,
                status: stage.status,
                at: Utc::now(),
            });
        }
    }

    fn status_event(&self, execution: &PipelineExecution) {
        self.events.broadcast(PipelineEvent::PipelineStatus {
            execution_id: execution.id,
            project_id: execution.project_id.clone(),
            status: execution.status,
            error: execution.error.clone(),
            at: Utc::now(),
        });
    }

    async fn finish(&self, execution: &PipelineExecution, config: &PipelineConfiguration) {
        obs::emit_pipeline_finished(
            execution.id,
            execution.status,
            execution.duration_ms().unwrap_or(0),
        );
        self.audit.record(
            AuditEntry::new(
                AuditAction::PipelineFinished,
                format!("pipeline finished: {:?}", execution.status),
            )
            .actor(execution.triggered_by.name.clone())
            .project(&execution.project_id)
            .subject(execution.id)
            .context(json!({
                "status": execution.status,
                "error": execution.error,
                "stages": execution
                    .stages
                    .iter()
                    .map(|s| json!({ "name": s.name, "status": s.status }))
                    .collect::<Vec<_>>(),
            })),
        );
        self.status_event(execution);

        if execution.status == PipelineStatus::Failed && config.settings.report_failures_as_issues {
            self.file_issue(execution).await;
        }
    }

    /// File an issue for a failed execution. Never fails the caller.
    async fn file_issue(&self, execution: &PipelineExecution) {
        let Some(source_control) = &self.source_control else {
            warn!("failure reporting enabled without a source control provider");
            return;
        };

        let failed_stage = execution
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Failed);
        let short_commit: String = execution.commit_id.chars().take(8).collect();
        let title = match failed_stage {
            Some(stage) => format!("Pipeline failed at {} on {}@{}", stage.name, execution.branch, short_commit),
            None => format!("Pipeline failed on {}@{}", execution.branch, short_commit),
        };
        let mut body = format!(
            "Execution `{}` triggered by {} failed.\n\n",
            execution.id, execution.triggered_by
        );
        if let Some(error) = &execution.error {
            body.push_str(&format!("Error: {error}\n"));
        }
        if let Some(stage) = failed_stage {
            let tail: Vec<&str> = stage.output.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            body.push_str(&format!("\n```\n{}\n```\n", tail.join("\n")));
        }
        let labels = vec![FAILURE_ISSUE_LABEL.to_string()];

        let filed = retry_with_backoff(
            &self.issue_retry,
            |e: &shipline_core::SourceControlError| e.is_transient(),
            |_| source_control.create_issue(&execution.project_id, &title, &body, &labels),
        )
        .await;

        let entry = match &filed.result {
            Ok(number) => {
                info!(issue = number, attempts = filed.attempts, "failure issue filed");
                AuditEntry::new(AuditAction::IssueFiled, format!("filed issue #{number}"))
                    .context(json!({ "issue": number, "attempts": filed.attempts }))
            }
            Err(err) => {
                warn!(error = %err, attempts = filed.attempts, "could not file failure issue");
                AuditEntry::new(AuditAction::IssueFiled, "failed to file issue")
                    .context(json!({ "error": err.to_string(), "attempts": filed.attempts }))
            }
        };
        self.audit.record(
            entry
                .actor(execution.triggered_by.name.clone())
                .project(&execution.project_id)
                .subject(execution.id),
        );
    }

    fn deny(&self, actor: &Actor, action: &str, subject: Option<Uuid>) {
        let mut entry = AuditEntry::new(AuditAction::PipelineDenied, format!("{actor} may not {action}"))
            .actor(actor.name.clone());
        if let Some(id) = subject {
            entry = entry.subject(id);
        }
        self.audit.record(entry);
    }
}

/// Hand the deploy stage to the dispatcher. The stage stays running while
/// a gated deployment waits for its decision; a rejection fails it.
async fn deploy(
    dispatcher: &DeploymentDispatcher,
    execution: &PipelineExecution,
    config: &PipelineConfiguration,
) -> StageOutcome {
    let outcome = dispatcher
        .dispatch(
            execution.id,
            config.id,
            &execution.project_id,
            &execution.environment,
            &execution.commit_id,
            &execution.triggered_by,
        )
        .await;
    match outcome {
        DeployOutcome::Deployed { request_id, output } => {
            StageOutcome::success(format!("deployment {request_id} succeeded\n{output}"))
        }
        DeployOutcome::Failed { request_id, reason } => {
            let output = request_id
                .map(|id| format!("deployment {id} failed"))
                .unwrap_or_default();
            StageOutcome::failed(output, reason)
        }
    }
}
