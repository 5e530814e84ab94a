//! Error types for dedupio
//!
//! This module defines the error type shared by configuration loading and
//! the progress event codec.

use thiserror::Error;

/// Common result type for dedupio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dedupio
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}
