//! Tidelog Error Types

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tidelog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tidelog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Replication log errors
    #[error("Corrupted replication file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Replication file {0} has been deleted")]
    FileDeleted(PathBuf),

    #[error("Transaction id {tx_id} is below the first transaction {first_tx_id} of this file")]
    InvalidTxId { tx_id: u64, first_tx_id: u64 },

    #[error("Log error: {0}")]
    Log(String),

    // Wire protocol errors
    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Receive timeout after {0:?}")]
    ReceiveTimeout(std::time::Duration),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::ConnectionFailed { .. } | Error::ReceiveTimeout(_)
        )
    }
}
