//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock abstraction (system time vs mock)
//! - Configuration loading and logging setup
//! - Circuit-breaker decorators for downstream clients
//! - An in-process message queue

pub mod clock;
pub mod config;
pub mod guarded;
pub mod logging;
pub mod queue;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides a controllable clock, a scripted event
/// handler and a log-capturing layer.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// queue-guard = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
