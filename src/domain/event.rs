//! Inbound event envelopes.
//!
//! Payloads are opaque JSON documents. The only field the control plane
//! inspects is `event_type`, which selects both the rate limiter bucket and
//! the processor.

use serde::Deserialize;

/// Event types published by the upstream services.
pub mod types {
    pub const MATERIAL_UPLOADED: &str = "material_uploaded";
    pub const MATERIAL_REPROCESS: &str = "material_reprocess";
    pub const MATERIAL_DELETED: &str = "material_deleted";
    pub const ASSESSMENT_ATTEMPT: &str = "assessment_attempt";
    pub const STUDENT_ENROLLED: &str = "student_enrolled";
    pub const STUDENT_UNENROLLED: &str = "student_unenrolled";
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event_type: Option<String>,
}

/// Why an envelope could not yield an event type.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The payload is not a JSON object.
    #[error("invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The payload has no usable `event_type`.
    #[error("missing event_type field in message")]
    MissingEventType,
}

/// Extract the `event_type` field from a JSON payload.
///
/// Unknown fields are ignored; an absent, null or empty `event_type` is an error.
///
/// # Example
/// ```
/// use queue_guard::domain::event::event_type_of;
///
/// let body = br#"{"event_type":"material_uploaded","payload":{"material_id":"m-1"}}"#;
/// assert_eq!(event_type_of(body).unwrap(), "material_uploaded");
/// assert!(event_type_of(b"{}").is_err());
/// ```
pub fn event_type_of(payload: &[u8]) -> Result<String, EnvelopeError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    match envelope.event_type {
        Some(event_type) if !event_type.is_empty() => Ok(event_type),
        _ => Err(EnvelopeError::MissingEventType),
    }
}
