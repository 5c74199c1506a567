//! Circuit breaker for downstream dependencies.
//!
//! A breaker isolates one dependency (object storage, the text generation
//! service, ...). While the dependency keeps failing, calls fail fast with
//! [`Denial::CircuitOpen`] instead of piling up; after a cool-down a bounded
//! number of probe calls decide whether to close the circuit again.
//!
//! ```text
//!   Closed --max_failures--> Open --timeout, next call--> HalfOpen
//!     ^                        ^                              |
//!     |                        +--------any failure-----------+
//!     +------------------success_threshold successes----------+
//! ```
//!
//! All bookkeeping happens under one mutex, which is never held while the
//! wrapped operation runs.

use crate::application::ports::{Clock, MetricsRecorder, NoopMetrics};
use crate::domain::error::{Denial, Error, Result};
use crate::infrastructure::clock::SystemClock;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests pass through; failures are counted.
    Closed,
    /// Requests are rejected without calling the dependency.
    Open,
    /// A limited number of probe requests test whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and metrics.
    pub name: String,
    /// Failures in Closed before the circuit opens.
    pub max_failures: u32,
    /// Time spent Open before the next call is let through as a probe.
    pub timeout: Duration,
    /// Concurrent probes admitted while HalfOpen. Zero is treated as one.
    pub max_half_open_requests: u32,
    /// Probe successes required to close the circuit.
    pub success_threshold: u32,
    /// A success this long after the last failure clears the failure count.
    pub failure_reset_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: 5,
            timeout: Duration::from_secs(60),
            max_half_open_requests: 1,
            success_threshold: 2,
            failure_reset_window: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Default settings under a given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Replace zero counts and durations with the defaults.
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.max_failures == 0 {
            self.max_failures = defaults.max_failures;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.max_half_open_requests == 0 {
            self.max_half_open_requests = defaults.max_half_open_requests;
        }
        if self.success_threshold == 0 {
            self.success_threshold = defaults.success_threshold;
        }
        if self.failure_reset_window.is_zero() {
            self.failure_reset_window = defaults.failure_reset_window;
        }
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    /// Probes currently in flight (HalfOpen only).
    requests: u32,
    /// Bumped on every transition; outcomes from an older generation are dropped.
    generation: u64,
    last_state_change: Instant,
    last_failure: Option<Instant>,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl Inner {
    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.failures = 0;
        self.successes = 0;
        self.requests = 0;
        self.generation += 1;
        self.last_state_change = now;
        if to == CircuitState::Closed {
            self.last_failure = None;
        }
        Some((from, to))
    }
}

/// Admission receipt for one request.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

/// Three-state circuit breaker.
///
/// [`execute`](Self::execute) is the only way to run work through the breaker.
///
/// # Example
/// ```
/// use queue_guard::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Error};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     max_failures: 2,
///     ..CircuitBreakerConfig::named("storage")
/// });
///
/// for _ in 0..2 {
///     let _ = breaker
///         .execute(|| async { Err::<(), _>(Error::transient("connection refused")) })
///         .await;
/// }
/// assert_eq!(breaker.state(), CircuitState::Open);
///
/// let err = breaker.execute(|| async { Ok(()) }).await.unwrap_err();
/// assert!(err.is_admission_denied());
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl CircuitBreaker {
    /// Create a breaker driven by the system clock, without metrics.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a breaker driven by a custom clock.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                requests: 0,
                generation: 0,
                last_state_change: now,
                last_failure: None,
            }),
            config,
            clock,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Attach a metrics recorder. The initial state is reported immediately.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        metrics.breaker_state(&self.config.name, self.state());
        self.metrics = metrics;
        self
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`Denial::CircuitOpen`] while the circuit is open and
    /// [`Denial::TooManyRequests`] when every half-open probe slot is taken;
    /// in both cases `f` is not called. Otherwise returns whatever `f`
    /// returns, after recording it as a success or failure.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.before_request()?;
        let mut guard = RequestGuard {
            breaker: self,
            ticket,
            finished: false,
        };

        let result = f().await;
        guard.finish(result.is_ok());
        result
    }

    /// Current state.
    ///
    /// An open circuit whose timeout has elapsed still reports `Open` until
    /// the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures counted in the current state.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Successes counted in the current state.
    pub fn successes(&self) -> u32 {
        self.lock().successes
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            let transition = inner.transition(CircuitState::Closed, now);
            inner.failures = 0;
            inner.successes = 0;
            inner.last_failure = None;
            transition
        };
        self.emit(transition);
    }

    fn before_request(&self) -> Result<Ticket> {
        let now = self.clock.now();
        let mut transition = None;

        let admitted = {
            let mut inner = self.lock();

            match inner.state {
                CircuitState::Open => {
                    if now.saturating_duration_since(inner.last_state_change) < self.config.timeout {
                        Err(Error::AdmissionDenied(Denial::CircuitOpen))
                    } else {
                        // The call that moves the circuit to HalfOpen is always the first probe.
                        transition = inner.transition(CircuitState::HalfOpen, now);
                        inner.requests = 1;
                        Ok(Ticket {
                            generation: inner.generation,
                            probe: true,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    // Check and increment under the same lock.
                    if inner.requests >= self.config.max_half_open_requests.max(1) {
                        Err(Error::AdmissionDenied(Denial::TooManyRequests))
                    } else {
                        inner.requests += 1;
                        Ok(Ticket {
                            generation: inner.generation,
                            probe: true,
                        })
                    }
                }
                CircuitState::Closed => Ok(Ticket {
                    generation: inner.generation,
                    probe: false,
                }),
            }
        };

        self.emit(transition);
        admitted
    }

    fn after_request(&self, ticket: Ticket, success: bool) {
        let now = self.clock.now();

        let transition = {
            let mut inner = self.lock();
            if inner.generation != ticket.generation {
                return;
            }

            match inner.state {
                CircuitState::Closed if success => {
                    inner.successes = inner.successes.saturating_add(1);
                    let quiet = inner.last_failure.is_some_and(|at| {
                        now.saturating_duration_since(at) >= self.config.failure_reset_window
                    });
                    if inner.failures > 0 && quiet {
                        inner.failures = 0;
                    }
                    None
                }
                CircuitState::Closed => {
                    inner.failures = inner.failures.saturating_add(1);
                    inner.last_failure = Some(now);
                    if inner.failures >= self.config.max_failures {
                        inner.transition(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if ticket.probe {
                        inner.requests = inner.requests.saturating_sub(1);
                    }
                    if success {
                        inner.successes = inner.successes.saturating_add(1);
                        if inner.successes >= self.config.success_threshold {
                            inner.transition(CircuitState::Closed, now)
                        } else {
                            None
                        }
                    } else {
                        inner.last_failure = Some(now);
                        inner.transition(CircuitState::Open, now)
                    }
                }
                CircuitState::Open => None,
            }
        };

        self.emit(transition);
    }

    /// Free a probe slot without recording an outcome.
    fn release(&self, ticket: Ticket) {
        if !ticket.probe {
            return;
        }
        let mut inner = self.lock();
        if inner.generation == ticket.generation && inner.state == CircuitState::HalfOpen {
            inner.requests = inner.requests.saturating_sub(1);
        }
    }

    fn emit(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };

        let name = self.config.name.as_str();
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                breaker = name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker probing"
            ),
            CircuitState::Closed => tracing::info!(
                breaker = name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker closed"
            ),
        }
        self.metrics.breaker_transition(name, from, to);
        self.metrics.breaker_state(name, to);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records the outcome of an admitted request, or frees its probe slot if
/// the request future is dropped before finishing.
struct RequestGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    finished: bool,
}

impl RequestGuard<'_> {
    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.breaker.after_request(self.ticket, success);
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.release(self.ticket);
        }
    }
}

/// Shareable circuit breaker reference.
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;
