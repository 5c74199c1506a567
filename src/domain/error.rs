//! Error taxonomy for admission control and operation outcomes.
//!
//! Every fallible operation in the crate resolves to [`Error`], a closed set of
//! variants that callers can match exhaustively:
//!
//! - [`Error::AdmissionDenied`] - the work never ran (circuit open, too many
//!   half-open probes, or cancelled while waiting for a token). Try later.
//! - [`Error::Permanent`] - malformed or unrecoverable input. Never retried.
//! - [`Error::Transient`] - everything else. Retried up to policy limits.
//! - [`Error::Cancelled`] - the caller's cancellation token fired mid-operation.

use std::fmt;

/// Boxed error used as the source of permanent and transient failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why an operation was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Denial {
    /// The circuit breaker is open and failing fast.
    CircuitOpen,
    /// The circuit breaker is half-open and every probe slot is taken.
    TooManyRequests,
    /// The cancellation token fired while waiting for a rate-limit token.
    Cancelled,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::CircuitOpen => write!(f, "circuit breaker is open"),
            Denial::TooManyRequests => write!(f, "too many requests"),
            Denial::Cancelled => write!(f, "cancelled while waiting for admission"),
        }
    }
}

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help.
    Permanent,
    /// Retrying may succeed.
    Transient,
}

/// Closed error type shared by every component.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was refused before it ran.
    #[error("admission denied: {0}")]
    AdmissionDenied(Denial),
    /// Unrecoverable failure.
    #[error("permanent failure: {0}")]
    Permanent(#[source] BoxError),
    /// Failure that may go away on a later attempt.
    #[error("transient failure: {0}")]
    Transient(#[source] BoxError),
    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an error as permanent.
    pub fn permanent<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Permanent(err.into())
    }

    /// Wrap an error as transient.
    pub fn transient<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Transient(err.into())
    }

    /// Default retry classification.
    ///
    /// `Permanent` and `Cancelled` are never retried. Admission denials and
    /// transient failures are.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Permanent(_) | Error::Cancelled => ErrorClass::Permanent,
            Error::AdmissionDenied(_) | Error::Transient(_) => ErrorClass::Transient,
        }
    }

    /// Check if the operation was refused before running.
    pub fn is_admission_denied(&self) -> bool {
        matches!(self, Error::AdmissionDenied(_))
    }

    /// Return the denial reason, if any.
    pub fn denial(&self) -> Option<Denial> {
        match self {
            Error::AdmissionDenied(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Check if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }

    /// Check if this is a transient failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<Denial> for Error {
    fn from(reason: Denial) -> Self {
        Error::AdmissionDenied(reason)
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
