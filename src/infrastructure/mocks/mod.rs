//! Mock implementations for testing.
//!
//! Controllable doubles for the clock, the event handler and the tracing
//! pipeline.

pub mod clock;
pub mod handler;
pub mod layer;

pub use clock::MockClock;
pub use handler::{ScriptedHandler, Step};
pub use layer::{CapturedEvent, MockCaptureLayer};
