//! Error types for the chat store

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error types
///
/// Payloads are plain strings so an error can be cloned out to every
/// waiter of a population attempt and every error-channel subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A cell's factory or fetch failed while filling it
    #[error("Population failed: {0}")]
    Population(String),

    /// An absent value was pushed into a merge-strategy cell
    #[error("Absent value pushed into merge cell: {0}")]
    MergeMisuse(String),

    /// A single-flight command failed
    #[error("Command failed: {0}")]
    Command(String),

    /// One item of a persistence batch failed
    #[error("Batch item {key} failed: {message}")]
    BatchItem { key: String, message: String },

    /// Backing store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote API error
    #[error("Network error: {0}")]
    Network(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A completion was dropped before it resolved
    #[error("Operation cancelled before completion")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Internal(err.to_string())
    }
}

#[cfg(feature = "native")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}
