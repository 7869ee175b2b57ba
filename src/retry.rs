//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::Result;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries until success
    pub max_attempts: Option<usize>,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Bounded policy with a fixed number of attempts.
    #[must_use]
    pub fn attempts(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_backoff,
            max_backoff: initial_backoff * 8,
            multiplier: 2.0,
        }
    }

    /// Policy that retries forever.
    #[must_use]
    pub fn unbounded(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    /// Create the backon builder for this policy
    #[must_use]
    pub fn builder(&self) -> ExponentialBuilder {
        // backon counts retries, not attempts
        let retries = self
            .max_attempts
            .map_or(usize::MAX, |attempts| attempts.saturating_sub(1));
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(retries)
    }
}

/// Execute `f` until it succeeds, `retryable` rejects the error, or the
/// policy is exhausted.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// use edge_trust::Error;
/// use edge_trust::retry::{RetryPolicy, with_retry};
///
/// # tokio_test::block_on(async {
/// let calls = AtomicUsize::new(0);
/// let policy = RetryPolicy::attempts(3, Duration::from_millis(1));
/// let value = with_retry(
///     &policy,
///     "flaky",
///     || async {
///         if calls.fetch_add(1, Ordering::SeqCst) == 0 {
///             Err(Error::ServiceUnavailable("busy".into()))
///         } else {
///             Ok(7)
///         }
///     },
///     |e| matches!(e, Error::ServiceUnavailable(_)),
/// )
/// .await
/// .unwrap();
/// assert_eq!(value, 7);
/// assert_eq!(calls.load(Ordering::SeqCst), 2);
/// # });
/// ```
///
/// # Errors
///
/// Returns the last error from `f`.
pub async fn with_retry<F, Fut, T, P>(policy: &RetryPolicy, name: &str, f: F, retryable: P) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&crate::Error) -> bool,
{
    f.retry(policy.builder())
        .sleep(tokio::time::sleep)
        .when(retryable)
        .notify(|e, delay: Duration| {
            debug!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %e,
                "Retrying after backoff"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_stops_after_max_attempts() {
        // GIVEN: three attempts, always failing with a retryable error
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::attempts(3, Duration::from_secs(2));

        // WHEN
        let result: Result<()> = with_retry(
            &policy,
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ServiceUnavailable("busy".into()))
            },
            |e| matches!(e, Error::ServiceUnavailable(_)),
        )
        .await;

        // THEN
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::unbounded(Duration::from_secs(3), Duration::from_secs(60));

        let result: Result<()> = with_retry(
            &policy,
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidConfiguration("bad".into()))
            },
            |e| matches!(e, Error::ServiceUnavailable(_)),
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::unbounded(Duration::from_secs(3), Duration::from_secs(60));

        let value = with_retry(
            &policy,
            "test",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err(Error::ServiceUnavailable("busy".into()))
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
