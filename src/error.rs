//! Error types for tierkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using TierError
pub type Result<T> = std::result::Result<T, TierError>;

/// Unified error type for tierkv operations
#[derive(Debug, Error)]
pub enum TierError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Pool Errors
    // -------------------------------------------------------------------------
    #[error("Pool image corrupted: {0}")]
    PoolCorruption(String),

    #[error("Out of persistent memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Pool crashed (simulated power loss); recovery required")]
    Crashed,

    #[error("Pool has a pending undo log; run recovery before starting a transaction")]
    RecoveryRequired,

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Write of {len} bytes at +{offset} exceeds logged range of {range} bytes")]
    OutOfRange { offset: usize, len: usize, range: usize },

    #[error("Transaction aborted")]
    Aborted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // List Errors
    // -------------------------------------------------------------------------
    #[error("Persistent list corrupted: {0}")]
    ListCorruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for TierError {
    fn from(err: bincode::Error) -> Self {
        TierError::Serialization(err.to_string())
    }
}
