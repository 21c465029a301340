//! Retry with exponential backoff.
//!
//! Used for stage attempts and for transient source control failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often, and how patiently, to retry an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_base_ms,
        }
    }

    /// Run once, never retry.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Outcome of a retried operation along with the number of attempts made.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, returns a non-retriable error, or the policy
/// is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    retriable: R,
    mut op: F,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if attempt < max_attempts && retriable(&err) => {
                tracing::debug!(attempt, max_attempts, "attempt failed, backing off");
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::new(3, 100);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(&RetryPolicy::new(3, 10), |_: &String| true, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("fail {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), 3);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retriable() {
        let out: Retried<(), &str> =
            retry_with_backoff(&RetryPolicy::new(5, 10), |e: &&str| *e != "fatal", |_| async {
                Err("fatal")
            })
            .await;
        assert_eq!(out.attempts, 1);
        assert!(out.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_policy() {
        let out: Retried<(), &str> =
            retry_with_backoff(&RetryPolicy::new(2, 10), |_| true, |_| async { Err("flaky") }).await;
        assert_eq!(out.attempts, 3);
    }
}
