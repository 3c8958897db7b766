//! Error types for the Clickrank service.

use thiserror::Error;

/// Main error type for Clickrank operations.
#[derive(Error, Debug)]
pub enum ClickrankError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed counter name supplied by a caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// Counter storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Increments lost when SQLite rolled back the pending write transaction
    #[error("{0} pending increments were rolled back by the storage engine")]
    RolledBack(u64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failures that leave an operation without a result
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Clickrank operations.
pub type Result<T> = std::result::Result<T, ClickrankError>;
