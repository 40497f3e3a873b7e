//! Error types for slidelog.

use thiserror::Error;

/// Main error type for slidelog operations.
#[derive(Error, Debug)]
pub enum SlidelogError {
    /// Invalid construction-time configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing event store could not be reached or answered with an error
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Identifiers must be non-empty
    #[error("Identifier must not be empty")]
    InvalidIdentifier,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlidelogError {
    /// Whether this error came from the event store rather than from the caller.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, SlidelogError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for SlidelogError {
    fn from(err: redis::RedisError) -> Self {
        SlidelogError::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SlidelogError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SlidelogError::StoreUnavailable("operation timed out".to_string())
    }
}

impl From<config::ConfigError> for SlidelogError {
    fn from(err: config::ConfigError) -> Self {
        SlidelogError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for SlidelogError {
    fn from(err: serde_yaml::Error) -> Self {
        SlidelogError::Config(err.to_string())
    }
}

/// Result type alias for slidelog operations.
pub type Result<T> = std::result::Result<T, SlidelogError>;
