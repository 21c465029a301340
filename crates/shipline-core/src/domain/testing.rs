//! Test suites and automated test executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a test suite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Unit,
    Integration,
    E2e,
}

impl SuiteKind {
    pub fn name(&self) -> &'static str {
        match self {
            SuiteKind::Unit => "unit",
            SuiteKind::Integration => "integration",
            SuiteKind::E2e => "e2e",
        }
    }
}

/// A configured test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub kind: SuiteKind,
    pub commands: Vec<String>,
    pub enabled: bool,
    /// Optional suites never block a `passed` verdict.
    pub optional: bool,
    pub timeout_secs: u64,
}

impl TestSuite {
    pub fn new(kind: SuiteKind, commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            commands,
            enabled: true,
            optional: false,
            timeout_secs,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of one suite inside a test execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    Pending,
    Running,
    Passed,
    Failed,
    /// Not started, or interrupted, because a sibling failed under fail-fast.
    Cancelled,
    /// Disabled by the test policy; never scheduled.
    Skipped,
}

impl SuiteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite: String,
    pub kind: SuiteKind,
    pub optional: bool,
    pub status: SuiteStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What caused a test execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestTrigger {
    Commit {
        commit_id: String,
        branch: String,
        author: String,
    },
    PullRequest {
        pr_id: u64,
        source_branch: String,
        target_branch: String,
        author: String,
    },
}

impl TestTrigger {
    pub fn branch(&self) -> &str {
        match self {
            TestTrigger::Commit { branch, .. } => branch,
            TestTrigger::PullRequest { source_branch, .. } => source_branch,
        }
    }

    pub fn pr_id(&self) -> Option<u64> {
        match self {
            TestTrigger::PullRequest { pr_id, .. } => Some(*pr_id),
            TestTrigger::Commit { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestExecutionStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
}

/// One automated run of a project's test suites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecution {
    pub id: Uuid,
    pub project_id: String,
    pub trigger: TestTrigger,
    pub status: TestExecutionStatus,
    pub suites: Vec<SuiteResult>,
    pub merge_ready: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TestExecution {
    pub fn new(project_id: impl Into<String>, trigger: TestTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            trigger,
            status: TestExecutionStatus::Running,
            suites: Vec::new(),
            merge_ready: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Resolve the overall status from the suite results.
    ///
    /// `passed` only if every non-optional suite passed.
    pub fn resolve_status(&self) -> TestExecutionStatus {
        let required: Vec<_> = self
            .suites
            .iter()
            .filter(|s| !s.optional && s.status != SuiteStatus::Skipped)
            .collect();
        if required.iter().all(|s| s.status == SuiteStatus::Passed) {
            TestExecutionStatus::Passed
        } else if required.iter().any(|s| s.status == SuiteStatus::Failed) {
            TestExecutionStatus::Failed
        } else {
            TestExecutionStatus::Cancelled
        }
    }

    pub fn passed_count(&self) -> usize {
        self.suites
            .iter()
            .filter(|s| s.status == SuiteStatus::Passed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.suites
            .iter()
            .filter(|s| s.status == SuiteStatus::Failed)
            .count()
    }
}
