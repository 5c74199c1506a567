//! Retry with exponential backoff.
//!
//! An operation is invoked up to `max_attempts` times. Failures classified as
//! permanent end the loop immediately; transient failures are retried after
//! a backoff that grows by `backoff_multiplier` up to `max_backoff`. Once the
//! attempts run out the last error is returned as-is, so callers can still
//! inspect and classify it.

use crate::domain::error::{Error, ErrorClass, Result};
use crate::domain::policy::RetryPolicy;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Decides whether an error is worth retrying.
pub type Classifier = Arc<dyn Fn(&Error) -> ErrorClass + Send + Sync>;

/// Runs operations under a [`RetryPolicy`].
///
/// # Example
/// ```
/// use queue_guard::{Error, RetryExecutor, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0);
/// let calls = AtomicU32::new(0);
///
/// let value = RetryExecutor::new(policy)
///     .run(&CancellationToken::new(), || async {
///         if calls.fetch_add(1, Ordering::SeqCst) == 0 {
///             Err(Error::transient("connection reset"))
///         } else {
///             Ok(42)
///         }
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(value, 42);
/// assert_eq!(calls.load(Ordering::SeqCst), 2);
/// # }
/// ```
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Classifier,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Executor using [`Error::class`] to classify failures.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(|err: &Error| err.class()),
        }
    }

    /// Replace the classifier.
    ///
    /// ```
    /// use queue_guard::{Error, ErrorClass, RetryExecutor, RetryPolicy};
    ///
    /// // Treat every failure as permanent: run once, never retry.
    /// let executor = RetryExecutor::new(RetryPolicy::default())
    ///     .with_classifier(|_: &Error| ErrorClass::Permanent);
    /// # let _ = executor;
    /// ```
    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: Fn(&Error) -> ErrorClass + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// Cancellation is checked before every attempt, including the first,
    /// and interrupts the backoff sleep; either way the result is
    /// [`Error::Cancelled`].
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut backoff = self.policy.initial_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if (self.classifier)(&err) == ErrorClass::Permanent {
                tracing::warn!(attempt, error = %err, "permanent error, not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::error!(attempts = attempt, error = %err, "max retry attempts exceeded");
                return Err(err);
            }

            tracing::warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient error, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = self.policy.next_backoff(backoff);
        }
    }
}

/// Run `operation` under `policy` with the default classifier.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(policy.clone()).run(cancel, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::Denial;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_millis(250),
            2.0,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = with_retry(&CancellationToken::new(), &policy(4), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("done")
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_single_attempt() {
        let calls = AtomicU32::new(0);

        let err = with_retry(&CancellationToken::new(), &policy(4), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::permanent("invalid payload"))
        })
        .await
        .unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let stamps = Mutex::new(Vec::new());

        with_retry(&CancellationToken::new(), &policy(4), || async {
            stamps.lock().unwrap().push(Instant::now());
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("timeout"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stamps = stamps.into_inner().unwrap();
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= first_gap);
        assert!(second_gap <= Duration::from_millis(250) + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_clamped_to_max() {
        let stamps = Mutex::new(Vec::new());

        let err = with_retry(&CancellationToken::new(), &policy(5), || async {
            stamps.lock().unwrap().push(Instant::now());
            Err::<(), _>(Error::transient("unavailable"))
        })
        .await
        .unwrap_err();

        assert!(err.is_transient());
        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 5);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[1] >= w[0]), "gaps must not shrink: {:?}", gaps);
        assert!(gaps[2] >= Duration::from_millis(250));
        assert!(gaps[3] < Duration::from_millis(260));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);

        let err = with_retry(&CancellationToken::new(), &policy(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::transient(format!("failure {}", n)))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.is_transient());
        assert!(err.to_string().contains("failure 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let err = with_retry(&cancel, &policy(4), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let long = RetryPolicy::new(4, Duration::from_secs(60), Duration::from_secs(60), 1.0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = with_retry(&cancel, &long, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::transient("busy"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(policy(4)).with_classifier(|err: &Error| {
            if err.denial() == Some(Denial::CircuitOpen) {
                ErrorClass::Permanent
            } else {
                err.class()
            }
        });

        let err = executor
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::AdmissionDenied(Denial::CircuitOpen))
            })
            .await
            .unwrap_err();

        assert_eq!(err.denial(), Some(Denial::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_denial_retried_by_default() {
        let calls = AtomicU32::new(0);

        with_retry(&CancellationToken::new(), &policy(4), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::AdmissionDenied(Denial::TooManyRequests))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
