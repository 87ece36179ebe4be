//! Error types for the storage and aggregation layer.

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the columnar store, the cache store and the codecs
/// that sit between them and the pipeline.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Columnar store failures (connection, statement, transaction)
    #[error("Store error: {0}")]
    Store(String),

    /// Cache/aggregate store failures
    #[error("Cache error: {0}")]
    Cache(String),

    /// JSON encoding or decoding of an envelope failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Building the columnar representation of a batch failed
    #[error("Encoding error: {0}")]
    Encoding(#[from] arrow_schema::ArrowError),

    /// An operation exceeded its deadline
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<duckdb::Error> for StoreError {
    fn from(err: duckdb::Error) -> Self {
        Self::Store(err.to_string())
    }
}
