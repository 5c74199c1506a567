//! Token bucket admission control.
//!
//! A bucket holds up to `burst_size` tokens and refills continuously at
//! `requests_per_second`. Refill is lazy: it is computed from the elapsed
//! clock time whenever the bucket is touched, never by a background timer.
//! Each admitted unit of work consumes exactly one token.

use crate::application::ports::Clock;
use crate::domain::error::{Denial, Error, Result};
use crate::domain::policy::RatePolicy;
use crate::infrastructure::clock::SystemClock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often [`TokenBucket::wait`] re-checks for a token.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Single-key token bucket.
///
/// All state lives behind one mutex, so concurrent [`allow`](Self::allow)
/// calls are linearizable: exactly as many callers succeed as there are whole
/// tokens, never more.
///
/// # Example
/// ```
/// use queue_guard::{RatePolicy, TokenBucket};
///
/// let bucket = TokenBucket::new(RatePolicy::new(1.0, 3.0));
/// assert!(bucket.allow());
/// assert!(bucket.allow());
/// assert!(bucket.allow());
/// assert!(!bucket.allow());
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    policy: RatePolicy,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket driven by the system clock.
    pub fn new(policy: RatePolicy) -> Self {
        Self::with_clock(policy, SystemClock::shared())
    }

    /// Create a full bucket driven by a custom clock.
    pub fn with_clock(policy: RatePolicy, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState {
                tokens: policy.burst_size(),
                last_refill: now,
            }),
            policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock,
        }
    }

    /// Override the polling interval used by [`wait`](Self::wait).
    ///
    /// Intervals below one millisecond are raised to one millisecond.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Consume a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available or `cancel` fires.
    ///
    /// Polls [`allow`](Self::allow) every poll interval. Cancellation is
    /// checked before each sleep and raced against it, so a cancelled caller
    /// returns [`Denial::Cancelled`] without sleeping again.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.allow() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Error::AdmissionDenied(Denial::Cancelled));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::AdmissionDenied(Denial::Cancelled));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Current token count after refilling. Does not consume.
    pub fn tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Refill the bucket to capacity immediately.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.tokens = self.policy.burst_size();
        state.last_refill = now;
    }

    /// The policy this bucket was built from.
    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Burst capacity.
    pub fn max_tokens(&self) -> f64 {
        self.policy.burst_size()
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.policy.requests_per_second()
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.policy.requests_per_second())
            .min(self.policy.burst_size());
        // A clock that stepped backwards must not rewind the refill window.
        if now > state.last_refill {
            state.last_refill = now;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
