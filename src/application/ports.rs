//! Ports (interfaces) for the application layer.
//!
//! The control plane never talks to a broker, a clock, a metrics backend or a
//! downstream service directly. It depends on the traits below, and
//! infrastructure adapters (or tests) provide the implementations.

use crate::application::circuit_breaker::CircuitState;
use crate::domain::content::{Quiz, Summary};
use crate::domain::error::{BoxError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Port for obtaining current time.
///
/// Token refill and breaker timeouts are computed from this clock, so tests
/// can drive them deterministically with `MockClock`.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Final resolution of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Processing succeeded and the message was acknowledged.
    Acked,
    /// Processing (or admission) failed and the message was returned to the queue.
    Requeued,
    /// The message arrived after intake stopped and was returned untouched.
    Rejected,
}

impl DeliveryOutcome {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::Requeued => "requeued",
            DeliveryOutcome::Rejected => "rejected",
        }
    }
}

/// Side channel for counters and gauges.
///
/// Every method defaults to a no-op so recorders only implement what they
/// export. Implementations must be cheap and must never block.
pub trait MetricsRecorder: Send + Sync + Debug {
    /// A token was available without waiting.
    fn limiter_allowed(&self, _key: &str) {}

    /// A caller had to wait for a token.
    fn limiter_waited(&self, _key: &str, _waited: Duration) {}

    /// Tokens left in a bucket after an admission.
    fn limiter_tokens(&self, _key: &str, _tokens: f64) {}

    /// Current state of a named breaker.
    fn breaker_state(&self, _name: &str, _state: CircuitState) {}

    /// A breaker moved between states.
    fn breaker_transition(&self, _name: &str, _from: CircuitState, _to: CircuitState) {}

    /// A message was resolved.
    fn event_processed(&self, _event_type: &str, _outcome: DeliveryOutcome, _elapsed: Duration) {}
}

/// Recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}

/// A message handed out by a [`MessageSource`].
///
/// Exactly one of [`ack`](Delivery::ack) or [`nack`](Delivery::nack) is called
/// per delivery, and only after processing has finished.
#[async_trait]
pub trait Delivery: Send + 'static {
    /// Broker routing key the message was published with.
    fn routing_key(&self) -> &str;

    /// Raw payload.
    fn body(&self) -> &[u8];

    /// Acknowledge the message.
    async fn ack(self) -> std::result::Result<(), BoxError>;

    /// Reject the message, optionally returning it to the queue.
    async fn nack(self, requeue: bool) -> std::result::Result<(), BoxError>;
}

/// Stream of inbound messages.
#[async_trait]
pub trait MessageSource: Send {
    /// Delivery type produced by this source.
    type Delivery: Delivery;

    /// Wait for the next message. `None` means the source is exhausted.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message.
    async fn next_delivery(&mut self) -> Option<Self::Delivery>;
}

/// Processing contract invoked by the dispatcher for every admitted message.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Process a raw payload.
    ///
    /// `Ok(())` acknowledges the message; any error requeues it.
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()>;
}

/// A processor for a single event type.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Event type this processor handles, e.g. `"material_uploaded"`.
    fn event_type(&self) -> &str;

    /// Process the raw JSON payload.
    async fn process(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()>;
}

/// Object storage capability (S3, MinIO, local filesystem, ...).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Store an object.
    async fn upload(&self, key: &str, content: Vec<u8>) -> Result<()>;

    /// Remove an object.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Text generation capability (hosted model or local fallback).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Summarise a document.
    async fn generate_summary(&self, text: &str) -> Result<Summary>;

    /// Produce a quiz with `question_count` questions.
    async fn generate_quiz(&self, text: &str, question_count: usize) -> Result<Quiz>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;
}
