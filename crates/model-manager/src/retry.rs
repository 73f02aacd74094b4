//! Bounded exponential backoff for transient registry failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use common::error::{Error, Result};
use deploy_config::RetrySettings;

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay())
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// exhausts `policy`. Waiting between attempts is interrupted by `cancel`.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    "{} failed: {}; retrying in {:?}",
                    description,
                    err,
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled(description.to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(RetryPolicy::default(), policy);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result = with_backoff(&fast_policy(3), "list files", &cancel, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("list files", "connection reset"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result: Result<()> = with_backoff(&fast_policy(3), "download", &cancel, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("download", "timed out"))
        })
        .await;

        assert!(matches!(result, Err(Error::Transient { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_surface_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result: Result<()> = with_backoff(&fast_policy(3), "list files", &cancel, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Auth {
                repo: "meta-llama/Llama-3.2-3B-Instruct".into(),
                message: "401 Unauthorized".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(3, Duration::from_secs(60));

        let result: Result<()> = with_backoff(&policy, "download", &cancel, move || async move {
            Err(Error::transient("download", "timed out"))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
