//! In-memory metrics recorder.
//!
//! [`Metrics`] implements [`MetricsRecorder`] with atomics for totals and
//! `dashmap` for per-key series. Clones share storage, so one handle can be
//! injected into every component and another kept for reading.

use crate::application::circuit_breaker::CircuitState;
use crate::application::ports::{DeliveryOutcome, MetricsRecorder};
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Series<K, V> = DashMap<K, V, RandomState>;

/// Shared metrics recorder.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    events_acked: AtomicU64,
    events_requeued: AtomicU64,
    events_rejected: AtomicU64,
    processing_nanos: AtomicU64,
    events: Series<(String, DeliveryOutcome), u64>,
    limiter_allowed: Series<String, u64>,
    limiter_waits: Series<String, u64>,
    limiter_wait_nanos: Series<String, u64>,
    limiter_tokens: Series<String, f64>,
    breaker_states: Series<String, CircuitState>,
    breaker_transitions: Series<(String, CircuitState, CircuitState), u64>,
}

fn nanos(duration: Duration) -> u64 {
    duration.as_nanos().try_into().unwrap_or(u64::MAX)
}

fn bump<K>(series: &Series<K, u64>, key: K, by: u64)
where
    K: Eq + std::hash::Hash,
{
    *series.entry(key).or_insert(0) += by;
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages acknowledged after successful processing.
    pub fn events_acked(&self) -> u64 {
        self.inner.events_acked.load(Ordering::Relaxed)
    }

    /// Messages returned to the queue after a failure or denial.
    pub fn events_requeued(&self) -> u64 {
        self.inner.events_requeued.load(Ordering::Relaxed)
    }

    /// Messages returned untouched because intake had stopped.
    pub fn events_rejected(&self) -> u64 {
        self.inner.events_rejected.load(Ordering::Relaxed)
    }

    /// Last recorded state of a breaker.
    pub fn current_breaker_state(&self, name: &str) -> Option<CircuitState> {
        self.inner.breaker_states.get(name).map(|state| *state)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let collect = |series: &Series<String, u64>| -> HashMap<String, u64> {
            series.iter().map(|e| (e.key().clone(), *e.value())).collect()
        };

        MetricsSnapshot {
            events_acked: self.events_acked(),
            events_requeued: self.events_requeued(),
            events_rejected: self.events_rejected(),
            processing_time: Duration::from_nanos(inner.processing_nanos.load(Ordering::Relaxed)),
            events: inner.events.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            limiter_allowed: collect(&inner.limiter_allowed),
            limiter_waits: collect(&inner.limiter_waits),
            limiter_wait_time: inner
                .limiter_wait_nanos
                .iter()
                .map(|e| (e.key().clone(), Duration::from_nanos(*e.value())))
                .collect(),
            limiter_tokens: inner
                .limiter_tokens
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            breaker_states: inner
                .breaker_states
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            breaker_transitions: inner
                .breaker_transitions
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.events_acked.store(0, Ordering::Relaxed);
        inner.events_requeued.store(0, Ordering::Relaxed);
        inner.events_rejected.store(0, Ordering::Relaxed);
        inner.processing_nanos.store(0, Ordering::Relaxed);
        inner.events.clear();
        inner.limiter_allowed.clear();
        inner.limiter_waits.clear();
        inner.limiter_wait_nanos.clear();
        inner.limiter_tokens.clear();
        inner.breaker_states.clear();
        inner.breaker_transitions.clear();
    }
}

impl MetricsRecorder for Metrics {
    fn limiter_allowed(&self, key: &str) {
        bump(&self.inner.limiter_allowed, key.to_string(), 1);
    }

    fn limiter_waited(&self, key: &str, waited: Duration) {
        bump(&self.inner.limiter_waits, key.to_string(), 1);
        bump(&self.inner.limiter_wait_nanos, key.to_string(), nanos(waited));
    }

    fn limiter_tokens(&self, key: &str, tokens: f64) {
        self.inner.limiter_tokens.insert(key.to_string(), tokens);
    }

    fn breaker_state(&self, name: &str, state: CircuitState) {
        self.inner.breaker_states.insert(name.to_string(), state);
    }

    fn breaker_transition(&self, name: &str, from: CircuitState, to: CircuitState) {
        bump(&self.inner.breaker_transitions, (name.to_string(), from, to), 1);
    }

    fn event_processed(&self, event_type: &str, outcome: DeliveryOutcome, elapsed: Duration) {
        let total = match outcome {
            DeliveryOutcome::Acked => &self.inner.events_acked,
            DeliveryOutcome::Requeued => &self.inner.events_requeued,
            DeliveryOutcome::Rejected => &self.inner.events_rejected,
        };
        total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .processing_nanos
            .fetch_add(nanos(elapsed), Ordering::Relaxed);
        bump(&self.inner.events, (event_type.to_string(), outcome), 1);
    }
}

/// A point-in-time copy of every series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub events_acked: u64,
    pub events_requeued: u64,
    pub events_rejected: u64,
    /// Sum of processing time across resolved messages.
    pub processing_time: Duration,
    /// Resolved messages per (event type, outcome).
    pub events: HashMap<(String, DeliveryOutcome), u64>,
    /// Admissions that found a token immediately, per key.
    pub limiter_allowed: HashMap<String, u64>,
    /// Admissions that had to wait, per key.
    pub limiter_waits: HashMap<String, u64>,
    /// Total time spent waiting, per key.
    pub limiter_wait_time: HashMap<String, Duration>,
    /// Tokens left after the most recent admission, per key.
    pub limiter_tokens: HashMap<String, f64>,
    pub breaker_states: HashMap<String, CircuitState>,
    /// Transition counts per (breaker, from, to).
    pub breaker_transitions: HashMap<(String, CircuitState, CircuitState), u64>,
}

impl MetricsSnapshot {
    /// Total number of resolved messages.
    pub fn total_events(&self) -> u64 {
        self.events_acked
            .saturating_add(self.events_requeued)
            .saturating_add(self.events_rejected)
    }

    /// Resolved messages of one type with one outcome.
    pub fn events_with(&self, event_type: &str, outcome: DeliveryOutcome) -> u64 {
        self.events
            .get(&(event_type.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Number of times `breaker` moved from `from` to `to`.
    pub fn transitions(&self, breaker: &str, from: CircuitState, to: CircuitState) -> u64 {
        self.breaker_transitions
            .get(&(breaker.to_string(), from, to))
            .copied()
            .unwrap_or(0)
    }

    /// Fraction of resolved messages that were acknowledged (0.0 to 1.0).
    pub fn ack_rate(&self) -> f64 {
        let total = self.total_events();
        if total == 0 {
            0.0
        } else {
            self.events_acked as f64 / total as f64
        }
    }
}
