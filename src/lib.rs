//! # queue-guard
//!
//! Resilience and concurrency control for queue-driven workers.
//!
//! A worker consumes messages from a broker and pushes each one through
//! processing stages that call out to storage and text generation services.
//! This crate governs everything around that processing: how fast messages are
//! admitted, how failing dependencies are isolated, how failed work is retried
//! and how the process stops without losing acknowledgements.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queue_guard::infrastructure::config::WorkerConfig;
//! use queue_guard::infrastructure::logging;
//! use queue_guard::{ChannelQueue, Dispatcher, Metrics, ProcessorRegistry, ShutdownCoordinator};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkerConfig::from_path("worker.json")?;
//! logging::init(&config.logging);
//!
//! let metrics = Arc::new(Metrics::new());
//! let limiter = Arc::new(config.rate_limiter.build_limiter(metrics.clone()));
//! let registry = Arc::new(ProcessorRegistry::new());
//! // registry.register(Arc::new(MaterialUploadedProcessor::new(...)));
//!
//! let dispatcher = Dispatcher::new(registry, limiter)
//!     .with_metrics(metrics.clone())
//!     .with_drain(config.shutdown.wait_for_messages);
//!
//! let coordinator = ShutdownCoordinator::new(config.shutdown.timeout());
//! dispatcher.register_shutdown(&coordinator);
//!
//! let (_publisher, queue) = ChannelQueue::bounded(128);
//! let intake = tokio::spawn({
//!     let dispatcher = dispatcher.clone();
//!     async move { dispatcher.run(queue).await }
//! });
//!
//! coordinator.wait_for_signal().await?;
//! intake.await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! ### Token buckets
//!
//! [`TokenBucket`] refills lazily from elapsed time; there is no background
//! timer. [`MultiKeyLimiter`] keeps one bucket per event type:
//!
//! ```rust
//! use queue_guard::{MultiKeyLimiter, RatePolicy};
//!
//! let limiter = MultiKeyLimiter::builder()
//!     .policy("material_uploaded", RatePolicy::new(2.0, 5.0))
//!     .default_policy(RatePolicy::new(10.0, 20.0))
//!     .build();
//!
//! assert!(limiter.allow("material_uploaded"));
//! assert!(limiter.allow("student_enrolled")); // bucket created from the default
//! assert_eq!(limiter.event_types(), vec!["material_uploaded", "student_enrolled"]);
//! ```
//!
//! Without a default policy, keys that were never configured are not
//! throttled at all and [`MultiKeyLimiter::tokens`] reports `-1.0`.
//!
//! ### Circuit breaker
//!
//! [`CircuitBreaker`] moves between `Closed`, `Open` and `HalfOpen`. While
//! open it fails fast with [`Denial::CircuitOpen`]; after the timeout a
//! bounded number of probes decide whether it closes again.
//!
//! ```rust
//! use queue_guard::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Error};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     max_failures: 2,
//!     timeout: Duration::from_secs(30),
//!     ..CircuitBreakerConfig::named("nlp")
//! });
//!
//! for _ in 0..2 {
//!     let _ = breaker.execute(|| async { Err::<(), _>(Error::transient("503")) }).await;
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//!
//! let err = breaker.execute(|| async { Ok::<(), Error>(()) }).await.unwrap_err();
//! assert!(err.is_admission_denied());
//! # }
//! ```
//!
//! [`BreakerObjectStore`] and [`BreakerTextGenerator`] wrap downstream
//! clients so every call goes through a breaker without the caller noticing.
//!
//! ### Retries
//!
//! [`RetryExecutor`] classifies each error as permanent or transient and
//! retries transient ones with exponential backoff. The last error is
//! returned unchanged once attempts run out.
//!
//! ```rust
//! use queue_guard::{Error, RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let retry = RetryExecutor::new(RetryPolicy::new(
//!     3,
//!     Duration::from_millis(1),
//!     Duration::from_millis(4),
//!     2.0,
//! ));
//!
//! let mut calls = 0;
//! let result = retry
//!     .run(&CancellationToken::new(), || {
//!         calls += 1;
//!         let attempt = calls;
//!         async move {
//!             if attempt < 3 {
//!                 Err(Error::transient("timeout"))
//!             } else {
//!                 Ok(attempt)
//!             }
//!         }
//!     })
//!     .await;
//!
//! assert_eq!(result.unwrap(), 3);
//! # }
//! ```
//!
//! ### Graceful shutdown
//!
//! [`ShutdownCoordinator`] runs teardown tasks in reverse registration order,
//! one at a time, under a shared deadline. Every task runs even when an
//! earlier one fails; failures are reported together.
//!
//! ```rust
//! use queue_guard::{BoxError, ShutdownCoordinator};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
//! coordinator.register("database", |_ctx| async { Ok(()) });
//! coordinator.register("consumer", |_ctx| async { Err(BoxError::from("channel already closed")) });
//!
//! let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();
//! assert_eq!(err.failures()[0].name, "consumer");
//! # }
//! ```
//!
//! ### Dispatch
//!
//! [`Dispatcher`] takes messages from a [`MessageSource`], spawns one tracked
//! task per message, waits on the limiter keyed by the payload's
//! `event_type`, runs the [`EventHandler`] and acknowledges on success or
//! requeues on failure. On shutdown it stops intake and waits for in-flight
//! messages until the coordinator's deadline.
//!
//! ## Errors
//!
//! Every component reports [`Error`]: `AdmissionDenied` (circuit open, too
//! many half-open probes, or cancelled while waiting for a token),
//! `Permanent`, `Transient` and `Cancelled`. Teardown failures are collected
//! in [`ShutdownError`].
//!
//! ## Observability
//!
//! Components log decisions through `tracing` and report counters through an
//! injected [`MetricsRecorder`]. [`Metrics`] is an in-memory recorder:
//!
//! ```rust
//! use queue_guard::{Metrics, MultiKeyLimiter, RatePolicy};
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(Metrics::new());
//! let limiter = MultiKeyLimiter::builder()
//!     .default_policy(RatePolicy::new(1.0, 1.0))
//!     .metrics(metrics.clone())
//!     .build();
//!
//! limiter.allow("material_deleted");
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.limiter_allowed["material_deleted"], 1);
//! ```

// Domain layer - plain values
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    content::{Question, Quiz, Summary},
    error::{BoxError, Denial, Error, ErrorClass, Result},
    event::{event_type_of, EnvelopeError},
    policy::{RatePolicy, RetryPolicy},
};

pub use application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, SharedCircuitBreaker},
    dispatcher::{Dispatcher, DrainTimeout},
    limiter::TokenBucket,
    metrics::{Metrics, MetricsSnapshot},
    ports::{
        Clock, Delivery, DeliveryOutcome, EventHandler, MessageSource, MetricsRecorder,
        NoopMetrics, ObjectStore, Processor, TextGenerator,
    },
    processor::ProcessorRegistry,
    registry::{MultiKeyLimiter, MultiKeyLimiterBuilder, UNLIMITED},
    retry::{with_retry, Classifier, RetryExecutor},
    shutdown::{
        termination_signal, ShutdownContext, ShutdownCoordinator, ShutdownError, TaskFailure,
    },
};

pub use infrastructure::{
    clock::SystemClock,
    config::{ConfigError, WorkerConfig},
    guarded::{BreakerObjectStore, BreakerTextGenerator},
    logging::{LogFormat, LoggingConfig},
    queue::{ChannelDelivery, ChannelPublisher, ChannelQueue, Ledger, Settled, Settlement},
};
