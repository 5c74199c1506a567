//! Domain layer - plain values with no runtime dependencies.
//!
//! - Error taxonomy shared by every component
//! - Rate and retry policies
//! - Event envelope inspection
//! - Content types returned by text generation

pub mod content;
pub mod error;
pub mod event;
pub mod policy;
