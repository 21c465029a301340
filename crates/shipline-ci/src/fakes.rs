//! In-memory stage executor for testing.
//!
//! Returns canned results per stage name instead of spawning processes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use shipline_core::{StageError, StageTemplate};

use crate::runner::{StageContext, StageExecutor, StageResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStage {
    pub stage: String,
    pub commands: Vec<String>,
    pub environment: String,
    pub variables: Vec<(String, String)>,
}

/// Scripted [`StageExecutor`]. Unscripted stages pass with empty output.
#[derive(Default)]
pub struct ScriptedStageExecutor {
    outcomes: Mutex<HashMap<String, VecDeque<Result<String, StageError>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    executed: Mutex<Vec<ExecutedStage>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedStageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next execution of `stage`.
    pub fn push(&self, stage: &str, outcome: Result<String, StageError>) {
        lock(&self.outcomes)
            .entry(stage.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make the next executions of `stage` fail with `CommandFailed`.
    pub fn fail(&self, stage: &str, exit_code: i32) {
        self.push(
            stage,
            Err(StageError::CommandFailed {
                stage: stage.to_string(),
                command: format!("{stage}.sh"),
                exit_code,
            }),
        );
    }

    /// Every execution of `stage` takes `delay` before resolving.
    pub fn delay(&self, stage: &str, delay: Duration) {
        lock(&self.delays).insert(stage.to_string(), delay);
    }

    pub fn executed(&self) -> Vec<ExecutedStage> {
        lock(&self.executed).clone()
    }

    pub fn executed_names(&self) -> Vec<String> {
        lock(&self.executed).iter().map(|e| e.stage.clone()).collect()
    }

    /// Highest number of overlapping executions observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for ScriptedStageExecutor {
    async fn execute(&self, stage: &StageTemplate, ctx: &StageContext) -> StageResult {
        lock(&self.executed).push(ExecutedStage {
            stage: stage.name.clone(),
            commands: stage.commands.clone(),
            environment: ctx.environment.clone(),
            variables: ctx
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&stage.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = lock(&self.outcomes)
            .get_mut(&stage.name)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(String::new()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(output) => StageResult::passed(&stage.name, output),
            Err(err) => StageResult::failed(&stage.name, err),
        }
    }
}
