//! Retry logic with configurable backoff policies for a component's execute phase.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_registry::RetryHint;
use relay_types::{RelayError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay after a given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let millis = base_ms.saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis.min(*max_ms))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

/// How many times to call `exec`, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, BackoffPolicy::None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<RetryHint> for RetryPolicy {
    fn from(hint: RetryHint) -> Self {
        let backoff = if hint.wait_ms == 0 {
            BackoffPolicy::None
        } else {
            BackoffPolicy::Fixed {
                delay_ms: hint.wait_ms,
            }
        };
        Self::new(hint.max_attempts, backoff)
    }
}

/// Result of [`execute_with_retry`] plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Call `f` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` calls have been made.
///
/// `on_retry(attempt, delay, error)` runs before each backoff sleep.
pub async fn execute_with_retry<T, F, Fut, R>(
    f: F,
    policy: &RetryPolicy,
    node_id: &str,
    mut on_retry: R,
) -> Attempted<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    R: FnMut(u32, Duration, &RelayError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && !e.is_fatal() && attempt < max_attempts => {
                let delay = policy.backoff.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    node = %node_id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error, retrying"
                );
                on_retry(attempt, delay, &e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn no_wait(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, BackoffPolicy::None)
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let out = execute_with_retry(|| async { Ok(7) }, &no_wait(3), "node_a", |_, _, _| {}).await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn retry_on_retryable_error_succeeds() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();
        let mut retries = Vec::new();

        let out = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(RelayError::Other("flaky".into()))
                    } else {
                        Ok("recovered")
                    }
                }
            },
            &no_wait(3),
            "node_b",
            |attempt, _, _| retries.push(attempt),
        )
        .await;

        assert_eq!(out.result.unwrap(), "recovered");
        assert_eq!(out.attempts, 2);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert_eq!(retries, vec![1]);
    }

    #[tokio::test]
    async fn max_attempts_exhausted_returns_last_error() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();
        let out: Attempted<()> = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    let n = cc.fetch_add(1, Ordering::SeqCst);
                    Err(RelayError::Other(format!("failure {n}")))
                }
            },
            &no_wait(3),
            "node_c",
            |_, _, _| {},
        )
        .await;

        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.result.unwrap_err().to_string(), "failure 2");
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();
        let out: Attempted<()> = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(RelayError::Permanent("bad input".into()))
                }
            },
            &no_wait(5),
            "node_e",
            |_, _, _| {},
        )
        .await;

        assert!(matches!(out.result, Err(RelayError::Permanent(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let out = execute_with_retry(|| async { Ok(()) }, &no_wait(0), "node_z", |_, _, _| {}).await;
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed { delay_ms: 200 };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 100,
            max_ms: 500,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(63), Duration::from_millis(500));
    }

    #[test]
    fn none_backoff_zero_delay() {
        assert_eq!(BackoffPolicy::None.delay_for_attempt(9), Duration::ZERO);
    }

    #[test]
    fn retry_hint_conversion() {
        let policy = RetryPolicy::from(RetryHint {
            max_attempts: 3,
            wait_ms: 250,
        });
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, BackoffPolicy::Fixed { delay_ms: 250 });
        let policy = RetryPolicy::from(RetryHint {
            max_attempts: 2,
            wait_ms: 0,
        });
        assert_eq!(policy.backoff, BackoffPolicy::None);
    }

    #[test]
    fn policy_serde_shape() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 4,
            "backoff": {"kind": "exponential", "base_ms": 10, "max_ms": 80}
        }))
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff.delay_for_attempt(5), Duration::from_millis(80));
    }
}
