// Error handling module
// Defines the setup, transport and check error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a run before any iteration executes
#[derive(Error, Debug)]
pub enum LoadError {
    /// Bad scheduler configuration
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Required configuration value absent
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    /// Check names must be unique within a set
    #[error("Invalid check set: {0}")]
    InvalidCheckSet(String),

    /// Transport failure outside of a measured iteration (e.g. warmup)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Category of a per-iteration transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ConnectionFailed,
    DecodeError,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::ConnectionFailed => write!(f, "connection_failed"),
            TransportErrorKind::DecodeError => write!(f, "decode_error"),
        }
    }
}

/// A failed iteration. Never fatal for the run.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionFailed, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DecodeError, message)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_decode() {
            TransportErrorKind::DecodeError
        } else {
            // connect, request and body errors all mean the exchange never completed
            TransportErrorKind::ConnectionFailed
        };
        Self::new(kind, e.to_string())
    }
}

/// A predicate that could not be evaluated. Recorded as a failed check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckError {
    #[error("response body was not decoded")]
    MissingBody,

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("field {path} is not {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("predicate panicked: {0}")]
    Panicked(String),
}

/// Result type alias for setup operations
pub type Result<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LoadError::InvalidPolicy("rate must be > 0".to_string());
        assert_eq!(err.to_string(), "Invalid policy: rate must be > 0");

        let err = LoadError::MissingConfig("GRAPHQL_ENDPOINT".to_string());
        assert_eq!(err.to_string(), "Missing configuration: GRAPHQL_ENDPOINT");

        let err = LoadError::InvalidCheckSet("duplicate check: threads".to_string());
        assert_eq!(err.to_string(), "Invalid check set: duplicate check: threads");
    }

    #[test]
    fn test_transport_error_message() {
        let err = TransportError::timeout("operation timed out");
        assert_eq!(err.to_string(), "timeout: operation timed out");

        let err = TransportError::decode("expected value at line 1 column 1");
        assert_eq!(err.kind, TransportErrorKind::DecodeError);
        assert_eq!(
            err.to_string(),
            "decode_error: expected value at line 1 column 1"
        );
    }

    #[test]
    fn test_transport_error_is_transparent_in_load_error() {
        let err: LoadError = TransportError::connection_failed("refused").into();
        assert_eq!(err.to_string(), "connection_failed: refused");
    }

    #[test]
    fn test_internal_error_message() {
        let err = LoadError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
    }

    #[test]
    fn test_check_error_messages() {
        assert_eq!(
            CheckError::MissingField("data.threads".to_string()).to_string(),
            "missing field: data.threads"
        );
        assert_eq!(
            CheckError::TypeMismatch {
                path: "data.threads".to_string(),
                expected: "an array"
            }
            .to_string(),
            "field data.threads is not an array"
        );
    }

    #[test]
    fn test_transport_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TransportErrorKind::ConnectionFailed).unwrap();
        assert_eq!(json, "\"connection_failed\"");
    }
}
