//! Structured observability hooks for pipeline and deployment lifecycle events.
//!
//! Events are emitted at `info!` level (`warn!` for failures) with a fixed
//! `event` field so log pipelines can filter on it.

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{DeploymentStatus, PipelineStatus, StageStatus, StepOutcome};

/// Span tagging every log line of one execution with its id. Async work
/// attaches it with `Instrument::instrument`.
pub fn execution_span(execution_id: Uuid) -> tracing::Span {
    tracing::info_span!("shipline.execution", execution_id = %execution_id)
}

pub fn emit_pipeline_started(execution_id: Uuid, project_id: &str, commit_id: &str, branch: &str) {
    info!(
        event = "pipeline.started",
        execution_id = %execution_id,
        project_id = %project_id,
        commit_id = %commit_id,
        branch = %branch,
    );
}

pub fn emit_stage_transition(execution_id: Uuid, stage: &str, index: usize, status: StageStatus) {
    info!(
        event = "pipeline.stage",
        execution_id = %execution_id,
        stage = %stage,
        index = index,
        status = status.as_str(),
    );
}

/// Emit event: pipeline reached a terminal status.
pub fn emit_pipeline_finished(execution_id: Uuid, status: PipelineStatus, duration_ms: u64) {
    if status == PipelineStatus::Failed {
        warn!(event = "pipeline.finished", execution_id = %execution_id, status = ?status, duration_ms);
    } else {
        info!(event = "pipeline.finished", execution_id = %execution_id, status = ?status, duration_ms);
    }
}

pub fn emit_tests_finished(test_execution_id: Uuid, passed: usize, failed: usize, merge_ready: bool) {
    info!(
        event = "tests.finished",
        test_execution_id = %test_execution_id,
        passed,
        failed,
        merge_ready,
    );
}

pub fn emit_deployment_status(request_id: Uuid, environment: &str, status: DeploymentStatus) {
    info!(
        event = "deployment.status",
        request_id = %request_id,
        environment = %environment,
        status = %status,
    );
}

/// Emit event: a health check crossed its failure threshold.
pub fn emit_health_alert(session_id: Uuid, check_id: &str, consecutive_failures: u32) {
    warn!(
        event = "deployment.health_alert",
        session_id = %session_id,
        check_id = %check_id,
        consecutive_failures,
    );
}

pub fn emit_rollback_step(rollback_id: Uuid, step: &str, outcome: StepOutcome) {
    match outcome {
        StepOutcome::Failed => {
            warn!(event = "rollback.step", rollback_id = %rollback_id, step = %step, outcome = ?outcome)
        }
        _ => info!(event = "rollback.step", rollback_id = %rollback_id, step = %step, outcome = ?outcome),
    }
}
