//! Status and error types for mixer client operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical status codes shared with the policy server.
///
/// Mirrors the gRPC canonical codes so transport implementations can pass
/// server statuses through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Returns the canonical upper-case name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transport call (network, timeout or server error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: StatusCode,
    pub message: String,
}

impl TransportError {
    /// Creates a new transport error.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The server could not be reached.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// The call was abandoned before it completed.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// The transport's own timeout fired.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }
}

/// Final outcome of a Check, Report or Quota call other than success.
///
/// Internal signals (cache miss, stale entry, joining an in-flight call)
/// never appear here; only what crosses the public callback boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MixerError {
    /// Network, timeout or server failure.
    #[error("transport failure ({code}): {message}")]
    TransportFailure { code: StatusCode, message: String },

    /// Authoritative Check refusal from the server (possibly cached).
    #[error("request denied ({code}): {message}")]
    Denied { code: StatusCode, message: String },

    /// Authoritative quota refusal from the server.
    #[error("quota denied: {message}")]
    QuotaDenied { message: String },

    /// Quota outcome could not be determined because the transport failed.
    #[error("quota unknown ({code}): {message}")]
    QuotaUnknown { code: StatusCode, message: String },

    /// The call's attributes cannot be used for the requested operation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Invalid option combination, raised at construction.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// The client no longer accepts calls.
    #[error("mixer client is shut down")]
    ShutDown,
}

impl MixerError {
    /// Maps the error onto a canonical status code.
    pub fn code(&self) -> StatusCode {
        match self {
            MixerError::TransportFailure { code, .. }
            | MixerError::Denied { code, .. }
            | MixerError::QuotaUnknown { code, .. } => *code,
            MixerError::QuotaDenied { .. } => StatusCode::ResourceExhausted,
            MixerError::InvalidArgument { .. } => StatusCode::InvalidArgument,
            MixerError::Configuration { .. } => StatusCode::FailedPrecondition,
            MixerError::ShutDown => StatusCode::Unavailable,
        }
    }

    /// Converts a transport failure on the quota path into `QuotaUnknown`.
    pub fn quota_unknown(err: TransportError) -> Self {
        MixerError::QuotaUnknown {
            code: err.code,
            message: err.message,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        MixerError::Configuration {
            message: message.into(),
        }
    }
}

impl From<TransportError> for MixerError {
    fn from(err: TransportError) -> Self {
        MixerError::TransportFailure {
            code: err.code,
            message: err.message,
        }
    }
}

/// Result type for mixer operations.
pub type MixerResult<T> = Result<T, MixerError>;

/// Completion callback invoked exactly once with the outcome of a call.
pub type DoneFunc = Box<dyn FnOnce(MixerResult<()>) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts_to_transport_failure() {
        let err = TransportError::unavailable("connection refused");

        let mixer: MixerError = err.into();

        assert_eq!(
            mixer,
            MixerError::TransportFailure {
                code: StatusCode::Unavailable,
                message: "connection refused".to_string(),
            }
        );
        assert_eq!(mixer.code(), StatusCode::Unavailable);
    }

    #[test]
    fn test_quota_unknown_is_distinct_from_quota_denied() {
        let unknown = MixerError::quota_unknown(TransportError::deadline_exceeded("timed out"));
        let denied = MixerError::QuotaDenied {
            message: "exhausted".to_string(),
        };

        assert_ne!(unknown, denied);
        assert_eq!(unknown.code(), StatusCode::DeadlineExceeded);
        assert_eq!(denied.code(), StatusCode::ResourceExhausted);
    }

    #[test]
    fn test_error_messages_include_code() {
        let err = MixerError::Denied {
            code: StatusCode::PermissionDenied,
            message: "not allowed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "request denied (PERMISSION_DENIED): not allowed"
        );
    }
}
