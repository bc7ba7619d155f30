//! Bounded retries, per-call deadlines and visibility polling.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::ProviderError;
use crate::graph::Attributes;

use super::adapter::{Observed, ProviderAdapter};

/// Retry and deadline settings for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt ceiling, including the first attempt.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Deadline of a single call.
    pub call_timeout: Duration,
    /// How long a created resource may stay invisible.
    pub visibility_timeout: Duration,
}

/// Outcome of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Number of attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from executor settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: config.call_timeout(),
            visibility_timeout: config.visibility_timeout(),
        }
    }

    /// Delay after the given failed attempt (1-based), doubling each time.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// the attempt ceiling is reached. Each attempt is bounded by the call
    /// deadline; an attempt that exceeds it counts as a retryable failure.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(operation, self.call_timeout.as_secs_f64())),
            };

            match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "{operation} failed (attempt {attempt}/{}): {e}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// Polls `describe` until the handle becomes visible.
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the resource is still invisible when the
    /// visibility timeout elapses, or the first non-retryable describe error.
    pub async fn wait_until_visible(
        &self,
        adapter: &dyn ProviderAdapter,
        handle: &str,
    ) -> Result<Attributes, ProviderError> {
        let deadline = Instant::now() + self.visibility_timeout;
        let mut poll = 0;

        loop {
            poll += 1;
            let observed = tokio::time::timeout(self.call_timeout, adapter.describe(handle))
                .await
                .unwrap_or_else(|_| Err(ProviderError::timeout("describe", self.call_timeout.as_secs_f64())));

            match observed {
                Ok(Observed::Found(attrs)) => {
                    debug!("{handle} visible after {poll} poll(s)");
                    return Ok(attrs);
                }
                Ok(Observed::NotFound) => debug!("{handle} not visible yet"),
                Err(e) if e.retryable => debug!("describe {handle} failed: {e}"),
                Err(e) => return Err(e),
            }

            let delay = self.backoff_for(poll);
            if Instant::now() + delay > deadline {
                return Err(ProviderError::retryable(format!(
                    "{handle} not visible after {}s",
                    self.visibility_timeout.as_secs()
                )));
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use crate::provider::adapter::MockProviderAdapter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
            visibility_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..fast_policy(5)
        };

        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retryable_errors_retried_up_to_ceiling() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome: Attempted<()> = fast_policy(4)
            .run("create", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::retryable("throttled"))
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome: Attempted<()> = fast_policy(4)
            .run("create", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::fatal("invalid parameter"))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = fast_policy(5)
            .run("update", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::retryable("busy"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(outcome.result, Ok("done"));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_retryable() {
        let outcome: Attempted<()> = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..fast_policy(2)
        }
        .run("describe", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = outcome.result.expect_err("deadline");
        assert!(err.retryable);
        assert!(err.cause.contains("exceeded deadline"));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_wait_until_visible_polls_through_not_found() {
        let mut adapter = MockProviderAdapter::new();
        let mut seq = mockall::Sequence::new();
        adapter
            .expect_describe()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Observed::NotFound));
        adapter
            .expect_describe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Observed::Found(Attributes::new())));
        adapter.expect_kind().return_const(ResourceKind::Network);

        let attrs = fast_policy(3)
            .wait_until_visible(&adapter, "arn:vpc")
            .await
            .expect("visible");
        assert!(attrs.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_visible_gives_up() {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_describe().returning(|_| Ok(Observed::NotFound));

        let policy = RetryPolicy {
            visibility_timeout: Duration::from_millis(20),
            ..fast_policy(3)
        };
        let err = policy
            .wait_until_visible(&adapter, "arn:vpc")
            .await
            .expect_err("never visible");
        assert!(err.cause.contains("not visible"));
    }
}
