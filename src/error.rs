//! Error types for the Ratewarden engine.
//!
//! A denied request is not an error: it is reported through
//! [`RateLimitResult`](crate::ratelimit::RateLimitResult) with `allowed == false`.
//! Only structural misconfiguration and distributed store failures surface here.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The distributed store rejected or failed an operation
    #[error("Store error during {operation} on '{key}': {message}")]
    Store {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// The distributed store did not answer in time
    #[error("Store {operation} on '{key}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        key: String,
        timeout: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Build a store error for the given operation and key.
    pub fn store(operation: &'static str, key: impl Into<String>, message: impl ToString) -> Self {
        WardenError::Store {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error came from the distributed store.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            WardenError::Store { .. } | WardenError::StoreTimeout { .. }
        )
    }
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_carries_context() {
        let err = WardenError::store("increment", "user:u1", "connection refused");
        assert_eq!(
            err.to_string(),
            "Store error during increment on 'user:u1': connection refused"
        );
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_config_error_is_not_store_failure() {
        let err = WardenError::Config("requests must be positive".to_string());
        assert!(!err.is_store_failure());
    }
}
