//! Stage execution.
//!
//! A stage is a list of shell command lines run in order against an
//! execution context. The whole list shares one timeout per attempt; a
//! retriable failure re-runs the list from the top after a backoff.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use shipline_core::metrics::METRICS;
use shipline_core::{
    retry_with_backoff, PipelineExecution, RetryPolicy, StageError, StageKind, StageTemplate,
};

/// What a stage runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageContext {
    pub execution_id: Uuid,
    pub project_id: String,
    pub commit_id: String,
    pub branch: String,
    pub environment: String,
    /// Exported to every command in addition to the `SHIPLINE_*` variables.
    pub variables: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl StageContext {
    pub fn new(
        project_id: impl Into<String>,
        commit_id: impl Into<String>,
        branch: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            project_id: project_id.into(),
            commit_id: commit_id.into(),
            branch: branch.into(),
            environment: environment.into(),
            variables: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Context for a stage of `execution`; trigger parameters become variables.
    pub fn for_execution(execution: &PipelineExecution) -> Self {
        Self {
            execution_id: execution.id,
            project_id: execution.project_id.clone(),
            commit_id: execution.commit_id.clone(),
            branch: execution.branch.clone(),
            environment: execution.environment.clone(),
            variables: execution.parameters.clone(),
            working_dir: None,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn exports(&self, stage: &StageTemplate) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend([
            ("SHIPLINE_EXECUTION_ID".to_string(), self.execution_id.to_string()),
            ("SHIPLINE_PROJECT".to_string(), self.project_id.clone()),
            ("SHIPLINE_COMMIT".to_string(), self.commit_id.clone()),
            ("SHIPLINE_BRANCH".to_string(), self.branch.clone()),
            ("SHIPLINE_ENVIRONMENT".to_string(), self.environment.clone()),
            ("SHIPLINE_STAGE".to_string(), stage.name.clone()),
        ]);
        vars
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Whether execution succeeded.
    pub success: bool,

    /// Interleaved command echo, stdout and stderr of the final attempt.
    pub output: String,

    pub error: Option<StageError>,

    /// Attempts made, including the first.
    pub attempts: u32,

    /// Duration in milliseconds, across all attempts.
    pub duration_ms: u64,
}

impl StageResult {
    pub fn passed(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stage_name: name.into(),
            success: true,
            output: output.into(),
            error: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn failed(name: impl Into<String>, error: StageError) -> Self {
        Self {
            stage_name: name.into(),
            success: false,
            output: String::new(),
            error: Some(error),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Runs one stage to a terminal result. Failures are results, not errors.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, stage: &StageTemplate, ctx: &StageContext) -> StageResult;
}

/// Executes stage commands as `sh -c` subprocesses.
#[derive(Debug, Clone)]
pub struct CommandStageExecutor {
    retry_backoff_ms: u64,
}

impl Default for CommandStageExecutor {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 500,
        }
    }
}

impl CommandStageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base delay between attempts, doubled after each retry.
    pub fn with_retry_backoff_ms(mut self, retry_backoff_ms: u64) -> Self {
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    async fn attempt(
        &self,
        stage: &StageTemplate,
        ctx: &StageContext,
    ) -> Result<String, (StageError, String)> {
        if stage.commands.is_empty() {
            return Err((
                StageError::EmptyCommandList {
                    stage: stage.name.clone(),
                },
                String::new(),
            ));
        }

        let mut output = String::new();
        let run = run_commands(stage, ctx, &mut output);
        let outcome = if stage.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(stage.timeout_secs), run).await {
                Ok(outcome) => outcome,
                // Dropping the future kills the running child.
                Err(_) => Err(StageError::Timeout {
                    stage: stage.name.clone(),
                    timeout_secs: stage.timeout_secs,
                }),
            }
        } else {
            run.await
        };

        match outcome {
            Ok(()) => Ok(output),
            Err(err) => Err((err, output)),
        }
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, stage: &StageTemplate, ctx: &StageContext) -> StageResult {
        let start = Instant::now();
        let policy = RetryPolicy::new(stage.retry_count, self.retry_backoff_ms);

        let retried = retry_with_backoff(
            &policy,
            |(err, _): &(StageError, String)| err.is_retriable(),
            |attempt| {
                debug!(stage = %stage.name, attempt, "running stage attempt");
                self.attempt(stage, ctx)
            },
        )
        .await;

        METRICS.inc_stages_executed();
        let duration_ms = start.elapsed().as_millis() as u64;
        match retried.result {
            Ok(output) => StageResult {
                stage_name: stage.name.clone(),
                success: true,
                output,
                error: None,
                attempts: retried.attempts,
                duration_ms,
            },
            Err((error, output)) => {
                warn!(stage = %stage.name, attempts = retried.attempts, %error, "stage failed");
                StageResult {
                    stage_name: stage.name.clone(),
                    success: false,
                    output,
                    error: Some(error),
                    attempts: retried.attempts,
                    duration_ms,
                }
            }
        }
    }
}

/// Run every command line in order, appending to `output` as each exits.
async fn run_commands(
    stage: &StageTemplate,
    ctx: &StageContext,
    output: &mut String,
) -> Result<(), StageError> {
    let exports = ctx.exports(stage);
    for line in &stage.commands {
        output.push_str("$ ");
        output.push_str(line);
        output.push('\n');

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(line)
            .envs(exports.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &ctx.working_dir {
            command.current_dir(dir);
        }

        let spawn_error = |e: std::io::Error| StageError::Spawn {
            stage: stage.name.clone(),
            command: line.clone(),
            reason: e.to_string(),
        };
        let child = command.spawn().map_err(spawn_error)?;
        let result = child.wait_with_output().await.map_err(spawn_error)?;

        output.push_str(&String::from_utf8_lossy(&result.stdout));
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        if !result.status.success() {
            let exit_code = result.status.code().unwrap_or(-1);
            return Err(if stage.kind == StageKind::SecurityScan {
                StageError::SecurityViolation {
                    stage: stage.name.clone(),
                    detail: format!("`{line}` exited with code {exit_code}"),
                }
            } else {
                StageError::CommandFailed {
                    stage: stage.name.clone(),
                    command: line.clone(),
                    exit_code,
                }
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StageContext {
        StageContext::new("shop", "abc1234", "main", "development")
    }

    fn stage(commands: &[&str]) -> StageTemplate {
        StageTemplate::custom(
            "smoke",
            commands.iter().map(|c| c.to_string()).collect(),
            30,
        )
    }

    fn executor() -> CommandStageExecutor {
        CommandStageExecutor::new().with_retry_backoff_ms(1)
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = executor().execute(&stage(&["echo hello"]), &ctx()).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.output.contains("$ echo hello"));
        assert!(result.output.contains("hello\n"));
    }

    #[tokio::test]
    async fn test_commands_stop_at_first_failure() {
        let result = executor()
            .execute(&stage(&["echo one", "exit 3", "echo never"]), &ctx())
            .await;
        assert!(!result.success);
        assert!(!result.output.contains("never"));
        assert_eq!(
            result.error,
            Some(StageError::CommandFailed {
                stage: "smoke".into(),
                command: "exit 3".into(),
                exit_code: 3,
            })
        );
    }

    #[tokio::test]
    async fn test_retries_until_exhausted() {
        let result = executor()
            .execute(&stage(&["false"]).with_retries(2), &ctx())
            .await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_flaky_command() {
        let dir = tempfile::tempdir().unwrap();
        // Fails the first time, passes once the marker exists.
        let flaky = stage(&["if [ -f marker ]; then echo ok; else touch marker; exit 1; fi"])
            .with_retries(2);
        let result = executor()
            .execute(&flaky, &ctx().with_working_dir(dir.path()))
            .await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_timeout_is_retriable_failure() {
        let mut slow = stage(&["sleep 5"]);
        slow.timeout_secs = 1;
        let result = executor().execute(&slow, &ctx()).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(StageError::Timeout { timeout_secs: 1, .. })));
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_security_scan_failure_is_not_retried() {
        let scan = StageTemplate::new(StageKind::SecurityScan, vec!["exit 1".into()], 30)
            .with_retries(3);
        let result = executor().execute(&scan, &ctx()).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.error, Some(StageError::SecurityViolation { .. })));
    }

    #[tokio::test]
    async fn test_empty_command_list() {
        let result = executor().execute(&stage(&[]), &ctx()).await;
        assert!(matches!(result.error, Some(StageError::EmptyCommandList { .. })));
    }

    #[tokio::test]
    async fn test_context_is_exported() {
        let ctx = ctx().with_variable("REGION", "eu-west-1");
        let result = executor()
            .execute(
                &stage(&["echo $SHIPLINE_BRANCH $SHIPLINE_ENVIRONMENT $SHIPLINE_STAGE $REGION"]),
                &ctx,
            )
            .await;
        assert!(result.output.contains("main development smoke eu-west-1"));
    }
}
