//! Bounded exponential-backoff retry.
//!
//! Attempt, sleep `base`, `2 * base`, `4 * base`, ... (capped at `max_delay`)
//! between attempts, and give up after `max_attempts` total attempts with the
//! last error.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::error::SyncError;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(32),
        }
    }

    /// Delay before attempt number `attempt` (1-based; attempt 1 has none).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Retry `op` on every error.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, label, op, |_| true).await
}

/// Retry `op` only while `should_retry` accepts the error.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                warn!(
                    op = label,
                    attempt,
                    max_attempts,
                    error = %format!("{:#}", err),
                    "attempt failed, retrying"
                );
                attempt += 1;
            }
        }
    }
}

/// Retry only errors classified as [`ErrorKind::TransientExternal`](crate::error::ErrorKind).
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, label, op, SyncError::is_transient).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(p.delay_for(1), Duration::ZERO);
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(4));
        assert_eq!(p.delay_for(5), Duration::from_secs(5));
        assert_eq!(p.delay_for(30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_after_fewer_failures_than_the_cap() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry(&fast(3), "flaky", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                anyhow::bail!("failure {}", n);
            }
            Ok::<u32, anyhow::Error>(n)
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_last_error_after_cap() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry(&fast(3), "always", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), anyhow::Error>(anyhow::anyhow!("failure {}", n))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "failure 2");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_transient(&fast(5), "auth", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), anyhow::Error>(anyhow::anyhow!("HTTP 401"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry_transient(&fast(3), "rate-limited", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(anyhow::Error::from(SyncError::transient("github", "HTTP 429")));
            }
            Ok("ok")
        })
        .await
        .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
