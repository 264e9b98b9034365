//! Capped exponential backoff around the external service adapters.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AnalysisError, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// Server-requested wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        FetchError::is_transient(self)
    }
}

impl Retryable for AnalysisError {
    fn is_transient(&self) -> bool {
        AnalysisError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        AnalysisError::retry_after(self)
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// the token is cancelled. `op` receives the 0-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= policy.max_attempts || !error.is_transient() || cancel.is_cancelled() {
            return Err(error);
        }

        let delay = error
            .retry_after()
            .map(|d| d.min(policy.max_delay))
            .unwrap_or_else(|| policy.delay_for(attempt - 1));

        tracing::warn!(
            operation,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_backoff(&fast(3), &CancellationToken::new(), "fetch", move |_| async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FetchError::Network("reset".to_string()))
            } else {
                Ok("body")
            }
        })
        .await;
        assert_eq!(result, Ok("body"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> =
            with_backoff(&fast(2), &CancellationToken::new(), "fetch", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Timeout(Duration::from_secs(1)))
            })
            .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> =
            with_backoff(&fast(5), &CancellationToken::new(), "analyze", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AnalysisError::MalformedPrompt("empty".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_backoff(&fast(5), &cancel, "fetch", move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Network("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
