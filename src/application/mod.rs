//! Application layer - the resilience and concurrency control plane.
//!
//! - Token bucket and multi-key limiter (admission control)
//! - Circuit breaker (failure isolation for one dependency)
//! - Retry executor (classification and exponential backoff)
//! - Shutdown coordinator (LIFO teardown under a deadline)
//! - Dispatcher (intake, processing and settlement of messages)
//! - Processor registry and in-memory metrics
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from brokers, clocks and downstream services.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod shutdown;
