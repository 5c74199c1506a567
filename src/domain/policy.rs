//! Admission and retry policies.
//!
//! Policies are plain values: they describe *how much* work is admitted and
//! *how* failed work is re-attempted, and carry no runtime state of their own.

use std::time::Duration;

/// Token bucket parameters: sustained rate and burst capacity.
///
/// Non-positive (or non-finite) inputs are clamped to `1.0` so a bucket can
/// never divide by zero or starve forever.
///
/// # Example
/// ```
/// use queue_guard::RatePolicy;
///
/// let policy = RatePolicy::new(5.0, 10.0);
/// assert_eq!(policy.requests_per_second(), 5.0);
/// assert_eq!(policy.burst_size(), 10.0);
///
/// let clamped = RatePolicy::new(0.0, -3.0);
/// assert_eq!(clamped.requests_per_second(), 1.0);
/// assert_eq!(clamped.burst_size(), 1.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePolicy {
    requests_per_second: f64,
    burst_size: f64,
}

impl RatePolicy {
    /// Create a rate policy, clamping invalid values to 1.
    pub fn new(requests_per_second: f64, burst_size: f64) -> Self {
        Self {
            requests_per_second: clamp_positive(requests_per_second),
            burst_size: clamp_positive(burst_size),
        }
    }

    /// Tokens added per second.
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    /// Maximum tokens held by the bucket.
    pub fn burst_size(&self) -> f64 {
        self.burst_size
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self::new(10.0, 20.0)
    }
}

fn clamp_positive(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

/// Exponential backoff retry policy.
///
/// `max_attempts` counts every invocation, including the first one.
///
/// # Example
/// ```
/// use queue_guard::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(250), 2.0);
/// let first = policy.initial_backoff();
/// let second = policy.next_backoff(first);
/// let third = policy.next_backoff(second);
///
/// assert_eq!(first, Duration::from_millis(100));
/// assert_eq!(second, Duration::from_millis(200));
/// assert_eq!(third, Duration::from_millis(250)); // clamped
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a retry policy.
    ///
    /// `max_attempts` is raised to at least 1, `max_backoff` to at least
    /// `initial_backoff`, and a multiplier below 1 (or NaN) becomes 1 so the
    /// backoff never shrinks.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        let backoff_multiplier = if backoff_multiplier.is_finite() && backoff_multiplier >= 1.0 {
            backoff_multiplier
        } else {
            1.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            backoff_multiplier,
        }
    }

    /// Total number of invocations allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the second attempt.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Upper bound for any delay.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Growth factor applied after every retry.
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Compute the delay following `current`, clamped to `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff_multiplier;
        if !next.is_finite() || next >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(next)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            4,
            Duration::from_millis(500),
            Duration::from_secs(10),
            2.0,
        )
    }
}
