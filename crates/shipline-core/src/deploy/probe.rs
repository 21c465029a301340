//! Health probes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::HealthCheckSpec;

/// Result of probing one health check once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub message: Option<String>,
}

impl ProbeOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// Probes a single health check. Probe failures are outcomes, never errors.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, check: &HealthCheckSpec) -> ProbeOutcome;
}

/// HTTP GET probe: passes when the response status equals
/// `check.expected_status` within `check.timeout_ms`.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, check: &HealthCheckSpec) -> ProbeOutcome {
        let response = self
            .client
            .get(&check.target)
            .timeout(Duration::from_millis(check.timeout_ms))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().as_u16() == check.expected_status => ProbeOutcome::pass(),
            Ok(resp) => ProbeOutcome::fail(format!(
                "{} returned {} (expected {})",
                check.target,
                resp.status().as_u16(),
                check.expected_status
            )),
            Err(err) if err.is_timeout() => {
                ProbeOutcome::fail(format!("{} timed out after {}ms", check.target, check.timeout_ms))
            }
            Err(err) => ProbeOutcome::fail(format!("{} unreachable: {err}", check.target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_target_fails_without_error() {
        let probe = HttpHealthProbe::new();
        let mut check = HealthCheckSpec::http("api", "http://127.0.0.1:9/health", 3);
        check.timeout_ms = 200;
        let outcome = probe.probe(&check).await;
        assert!(!outcome.passed);
        assert!(outcome.message.is_some());
    }
}
