//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Manually driven clock.
///
/// Lets tests refill token buckets and expire breaker timeouts without
/// sleeping.
///
/// # Examples
///
/// ```
/// use queue_guard::infrastructure::mocks::MockClock;
/// use queue_guard::{RatePolicy, TokenBucket};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = MockClock::starting_now();
/// let bucket = TokenBucket::with_clock(RatePolicy::new(10.0, 1.0), Arc::new(clock.clone()));
///
/// assert!(bucket.allow());
/// assert!(!bucket.allow());
///
/// clock.advance(Duration::from_millis(100));
/// assert!(bucket.allow());
/// ```
///
/// # Thread Safety
///
/// All clones share the same underlying instant, so advancing one clone
/// advances every component holding another.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    pub fn new(start: Instant) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock starting at the real current instant.
    pub fn starting_now() -> Self {
        Self::new(Instant::now())
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}
