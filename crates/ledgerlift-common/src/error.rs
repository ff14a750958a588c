//! Error types shared across ledgerlift crates

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ledgerlift operations
pub type Result<T> = std::result::Result<T, LiftError>;

/// Errors raised outside the migration engine proper: loading configuration,
/// persisting reports and checkpoints.
#[derive(Error, Debug)]
pub enum LiftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

impl LiftError {
    /// Build a configuration error from any displayable message
    pub fn config(message: impl Into<String>) -> Self {
        LiftError::Config(message.into())
    }
}
