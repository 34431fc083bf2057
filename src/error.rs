//! Error types for the Tollgate quota engine.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store errors. Recovered locally: a failed load starts an
    /// empty ledger, a failed save leaves the in-memory ledger standing.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unexpected faults while evaluating a quota window. Recovered by
    /// failing open.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
