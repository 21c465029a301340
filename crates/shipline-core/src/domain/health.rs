//! Health checks and per-deployment monitoring sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named probe against a deployed environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Stable identifier, unique within an environment.
    pub id: String,
    /// Probe target (an HTTP URL for the built-in probe).
    pub target: String,
    /// Status code that counts as healthy.
    pub expected_status: u16,
    /// Consecutive failures that trigger a rollback recommendation.
    pub failure_threshold: u32,
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,
    /// Critical checks form the reduced set re-run during rollback.
    pub critical: bool,
}

impl HealthCheckSpec {
    pub fn http(id: impl Into<String>, target: impl Into<String>, failure_threshold: u32) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            expected_status: 200,
            failure_threshold: failure_threshold.max(1),
            timeout_ms: 5_000,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Latest known state of one check inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckState {
    pub spec: HealthCheckSpec,
    /// `None` until the check has been probed once.
    pub last_passed: Option<bool>,
    pub consecutive_failures: u32,
    pub last_message: Option<String>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl CheckState {
    fn new(spec: HealthCheckSpec) -> Self {
        Self {
            spec,
            last_passed: None,
            consecutive_failures: 0,
            last_message: None,
            last_observed_at: None,
        }
    }

    pub fn threshold_reached(&self) -> bool {
        self.consecutive_failures >= self.spec.failure_threshold
    }
}

/// Health monitoring state for a single deployment.
///
/// `rollback_recommended` is monotonic: once set it stays set for the
/// lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSession {
    pub session_id: Uuid,
    pub deployment_id: Uuid,
    pub environment: String,
    pub checks: Vec<CheckState>,
    pub rollback_recommended: bool,
    /// Check whose counter first crossed its threshold.
    pub failing_check: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_observed_at: Option<DateTime<Utc>>,
    /// Set once the monitoring window is over; the session is then read-only.
    pub closed_at: Option<DateTime<Utc>>,
}

impl HealthSession {
    pub fn new(
        deployment_id: Uuid,
        environment: impl Into<String>,
        checks: Vec<HealthCheckSpec>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            deployment_id,
            environment: environment.into(),
            checks: checks.into_iter().map(CheckState::new).collect(),
            rollback_recommended: false,
            failing_check: None,
            started_at: now,
            last_observed_at: None,
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Apply one probe result.
    ///
    /// Returns `true` only when this result is the one that set
    /// `rollback_recommended`.
    pub fn record(
        &mut self,
        check_id: &str,
        passed: bool,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = self.checks.iter_mut().find(|c| c.spec.id == check_id) else {
            return false;
        };

        state.last_passed = Some(passed);
        state.last_message = message;
        state.last_observed_at = Some(now);
        if passed {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        self.last_observed_at = Some(now);

        if !self.rollback_recommended && state.threshold_reached() {
            self.rollback_recommended = true;
            self.failing_check = Some(check_id.to_string());
            return true;
        }
        false
    }

    pub fn counter(&self, check_id: &str) -> Option<u32> {
        self.checks
            .iter()
            .find(|c| c.spec.id == check_id)
            .map(|c| c.consecutive_failures)
    }

    pub fn close(&mut self, now: DateTime<Utc>) {
        if self.closed_at.is_none() {
            self.closed_at = Some(now);
        }
    }
}

/// Outcome of one probe within an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub passed: bool,
    pub consecutive_failures: u32,
    pub message: Option<String>,
}

/// Result of polling every check of a session once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthObservation {
    pub session_id: Uuid,
    pub deployment_id: Uuid,
    pub results: Vec<CheckResult>,
    pub rollback_recommended: bool,
    /// Set when this observation flipped the recommendation.
    pub newly_failing_check: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl HealthObservation {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(threshold: u32) -> HealthSession {
        HealthSession::new(
            Uuid::new_v4(),
            "production",
            vec![
                HealthCheckSpec::http("api", "http://localhost/health", threshold),
                HealthCheckSpec::http("db", "http://localhost/db", threshold),
            ],
            Utc::now(),
        )
    }

    #[test]
    fn success_resets_counter() {
        let mut s = session(3);
        let now = Utc::now();
        s.record("api", false, None, now);
        s.record("api", false, None, now);
        assert_eq!(s.counter("api"), Some(2));
        s.record("api", true, None, now);
        assert_eq!(s.counter("api"), Some(0));
        s.record("api", false, None, now);
        s.record("api", false, None, now);
        assert!(!s.rollback_recommended);
    }

    #[test]
    fn unbroken_run_crosses_threshold_once() {
        let mut s = session(3);
        let now = Utc::now();
        assert!(!s.record("db", false, None, now));
        assert!(!s.record("db", false, None, now));
        assert!(s.record("db", false, None, now));
        assert!(s.rollback_recommended);
        assert_eq!(s.failing_check.as_deref(), Some("db"));

        // Further failures do not re-flag, successes do not clear.
        assert!(!s.record("db", false, None, now));
        s.record("db", true, None, now);
        assert!(s.rollback_recommended);
    }

    #[test]
    fn unknown_check_is_ignored() {
        let mut s = session(1);
        assert!(!s.record("cache", false, None, Utc::now()));
        assert!(!s.rollback_recommended);
        assert!(s.last_observed_at.is_none());
    }

    #[test]
    fn zero_threshold_is_clamped_to_one() {
        let spec = HealthCheckSpec::http("api", "http://x", 0);
        assert_eq!(spec.failure_threshold, 1);
    }
}
