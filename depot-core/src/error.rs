//! Error types for Depot operations

use std::time::Duration;
use thiserror::Error;

/// Lifecycle and configuration-gate errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Store is not initialized")]
    NotInitialized,

    #[error("Store has been disposed")]
    Disposed,

    #[error("Lazy field loading is not configured for this store")]
    LazyFieldsNotConfigured,

    #[error("Internal lock poisoned")]
    LockPoisoned,
}

/// Transaction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Transaction failed: {reason}")]
    BackendFailed { reason: String },

    #[error("Transactions cannot be nested")]
    Nested,
}

/// Cursor decode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidCursorError {
    #[error("Cursor token is empty")]
    EmptyInput,

    #[error("Cursor token is not valid base64: {reason}")]
    BadEncoding { reason: String },

    #[error("Cursor payload is not valid JSON: {reason}")]
    MalformedPayload { reason: String },

    #[error("Cursor payload must be a JSON object")]
    NotAnObject,
}

/// A capability-gated operation was invoked on a backend that does not
/// advertise the capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Backend {backend} does not support {operation}")]
pub struct UnsupportedOperationError {
    pub backend: String,
    pub operation: String,
}

impl UnsupportedOperationError {
    pub fn new(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            operation: operation.into(),
        }
    }
}

/// Errors reported by a physical backend, propagated unchanged after
/// telemetry recording.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Read from {backend} failed: {reason}")]
    ReadFailed { backend: String, reason: String },

    #[error("Write to {backend} failed: {reason}")]
    WriteFailed { backend: String, reason: String },

    #[error("Sync on {backend} failed: {reason}")]
    SyncFailed { backend: String, reason: String },

    #[error("Conflict on {entity_id} reported by {backend}")]
    Conflict { backend: String, entity_id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Depot operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DepotError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Invalid cursor: {0}")]
    Cursor(#[from] InvalidCursorError),

    #[error("Unsupported operation: {0}")]
    Unsupported(#[from] UnsupportedOperationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Depot operations.
pub type DepotResult<T> = Result<T, DepotError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let msg = format!("{}", StateError::NotInitialized);
        assert!(msg.contains("not initialized"));

        let msg = format!("{}", StateError::Disposed);
        assert!(msg.contains("disposed"));
    }

    #[test]
    fn test_transaction_error_display_timeout() {
        let err = TransactionError::Timeout {
            timeout: Duration::from_secs(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5s"));
    }

    #[test]
    fn test_cursor_error_display() {
        let err = InvalidCursorError::BadEncoding {
            reason: "invalid byte".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("base64"));
        assert!(msg.contains("invalid byte"));
    }

    #[test]
    fn test_unsupported_operation_display() {
        let err = UnsupportedOperationError::new("rest", "get_field");
        let msg = format!("{}", err);
        assert!(msg.contains("rest"));
        assert!(msg.contains("get_field"));
    }

    #[test]
    fn test_backend_error_display_write_failed() {
        let err = BackendError::WriteFailed {
            backend: "rest".to_string(),
            reason: "503".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("rest"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_depot_error_from_variants() {
        let state = DepotError::from(StateError::NotInitialized);
        assert!(matches!(state, DepotError::State(_)));

        let tx = DepotError::from(TransactionError::Nested);
        assert!(matches!(tx, DepotError::Transaction(_)));

        let cursor = DepotError::from(InvalidCursorError::EmptyInput);
        assert!(matches!(cursor, DepotError::Cursor(_)));

        let unsupported = DepotError::from(UnsupportedOperationError::new("mem", "watch"));
        assert!(matches!(unsupported, DepotError::Unsupported(_)));

        let backend = DepotError::from(BackendError::Unavailable {
            backend: "rest".to_string(),
            reason: "offline".to_string(),
        });
        assert!(matches!(backend, DepotError::Backend(_)));

        let config = DepotError::from(ConfigError::InvalidValue {
            field: "sampling_rate".to_string(),
            value: "2.0".to_string(),
            reason: "must be in [0, 1]".to_string(),
        });
        assert!(matches!(config, DepotError::Config(_)));
    }
}
