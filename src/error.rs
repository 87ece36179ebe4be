//! Error types for the ingestion pipeline.

use eventstore_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Message stream unavailable or misused
    #[error("Stream error: {0}")]
    Stream(String),

    /// The publisher's transport buffer is gone
    #[error("Publish error: {0}")]
    Publish(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool already started")]
    AlreadyStarted,

    #[error("Worker pool not started")]
    NotStarted,
}

impl PipelineError {
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
