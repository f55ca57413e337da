//! Error types for mnemos-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using mnemos-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (out-of-range importance, invalid layer pair, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A live holder currently owns the write lease
    #[error("Resource '{resource}' is held by {holder}")]
    Contention { resource: String, holder: String },

    /// Gave up waiting for a write lease
    #[error("Timed out after {waited_ms}ms waiting for lease on '{resource}'")]
    LeaseTimeout { resource: String, waited_ms: u64 },

    /// Storage unreachable or corrupt
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// External store call exceeded its deadline
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Memory storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// Referenced record or entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The normalized kinds callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected synchronously, never retried
    Validation,
    /// Retryable with backoff
    Contention,
    /// Fatal for the current operation
    Unavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Contention => write!(f, "contention"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a contention error.
    pub fn contention(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::Contention {
            resource: resource.into(),
            holder: holder.into(),
        }
    }

    /// Create a lease timeout error.
    pub fn lease_timeout(resource: impl Into<String>, waited_ms: u64) -> Self {
        Self::LeaseTimeout {
            resource: resource.into(),
            waited_ms,
        }
    }

    /// Create a timeout error for an external store call.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Normalize into one of the kinds the orchestrator reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Contention { .. } | Self::LeaseTimeout { .. } => ErrorKind::Contention,
            Self::Unavailable(_)
            | Self::Timeout { .. }
            | Self::MemoryStorage(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::contention("sqlite", err.to_string())
            }
            Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::DatabaseCorrupt)
            | Some(ErrorCode::NotADatabase)
            | Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::ReadOnly) => Self::Unavailable(err.to_string()),
            _ => Self::MemoryStorage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_normalization() {
        assert_eq!(Error::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::contention("graph", "pid:1").kind(),
            ErrorKind::Contention
        );
        assert_eq!(Error::lease_timeout("graph", 10).kind(), ErrorKind::Contention);
        assert_eq!(Error::timeout("vector.query", 10).kind(), ErrorKind::Unavailable);
        assert_eq!(Error::unavailable("gone").kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_only_contention_is_retryable() {
        assert!(Error::contention("graph", "pid:1").is_retryable());
        assert!(Error::lease_timeout("graph", 10).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::unavailable("gone").is_retryable());
    }

    #[test]
    fn test_sqlite_busy_maps_to_contention() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(Error::from(err).kind(), ErrorKind::Contention);
    }
}
