//! Wall-clock adapter.
//!
//! Token buckets and circuit breakers read time through the `Clock` port and
//! never through `Instant::now()` directly. Production code uses
//! [`SystemClock`]; tests substitute `MockClock` (see
//! `crate::infrastructure::mocks`, enabled by the `test-helpers` feature).

use crate::application::ports::Clock;
use std::sync::Arc;
use std::time::Instant;

/// Monotonic system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// Shared handle suitable for injecting into limiters and breakers.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
