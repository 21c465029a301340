//! Merge gate evaluation for pull request test runs.

use serde::{Deserialize, Serialize};

use shipline_core::{SuiteStatus, TestExecution, TestExecutionStatus, TestPolicy};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Merge-readiness rules.
pub struct MergeGate;

impl MergeGate {
    /// Evaluate whether `execution` makes its pull request mergeable.
    ///
    /// Gate rule:
    /// - The execution must have finished
    /// - Every enabled, non-optional suite of `policy` must have a result
    /// - Every required result must be `passed`
    ///
    /// Optional and skipped suites never block. With
    /// `require_passing_for_merge` off the gate always passes.
    pub fn evaluate(execution: &TestExecution, policy: &TestPolicy) -> GateVerdict {
        if !policy.require_passing_for_merge {
            return GateVerdict {
                passed: true,
                violations: Vec::new(),
                message: "Passing tests not required for merge".to_string(),
            };
        }

        let mut violations = Vec::new();

        if execution.status == TestExecutionStatus::Running {
            violations.push("Test execution is still running".to_string());
        }

        for suite in policy.enabled_suites().filter(|s| !s.optional) {
            if !execution.suites.iter().any(|r| r.suite == suite.name) {
                violations.push(format!("Suite '{}' never ran", suite.name));
            }
        }

        for result in &execution.suites {
            if result.optional || result.status == SuiteStatus::Skipped {
                continue;
            }
            match result.status {
                SuiteStatus::Passed => {}
                SuiteStatus::Failed => violations.push(match &result.error {
                    Some(error) => format!("Suite '{}' failed: {}", result.suite, error),
                    None => format!("Suite '{}' failed", result.suite),
                }),
                SuiteStatus::Cancelled => {
                    violations.push(format!("Suite '{}' was cancelled", result.suite))
                }
                _ => violations.push(format!("Suite '{}' did not finish", result.suite)),
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All required suites passed".to_string()
        } else {
            format!("Merge blocked by {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
