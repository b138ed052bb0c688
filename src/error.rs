//! Error types for the ratecache engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for ratecache operations.
#[derive(Error, Debug)]
pub enum RateCacheError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An allow-list or deny-list entry that is not a valid CIDR range
    #[error("Invalid CIDR entry '{entry}': {source}")]
    InvalidCidr {
        entry: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    /// A request the engine refuses to evaluate
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateCacheError {
    fn from(err: config::ConfigError) -> Self {
        RateCacheError::Config(err.to_string())
    }
}

/// Result type alias for ratecache operations.
pub type Result<T> = std::result::Result<T, RateCacheError>;
