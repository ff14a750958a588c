//! Error types for the ledgerlift CLI
//!
//! Messages are user-facing and say what to do next.

use ledgerlift_common::LiftError;
use ledgerlift_engine::{EngineError, TargetError};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file missing, unreadable or inconsistent
    #[error("{0}. Check the --config file and LEDGERLIFT_* environment variables.")]
    Config(#[from] LiftError),

    /// The engine refused or aborted the operation
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// Target database unreachable or rejecting statements
    #[error("Database error: {0}. Check DATABASE_URL and that the schema is applied.")]
    Target(#[from] TargetError),

    #[error("No database configured. Pass --database-url, set DATABASE_URL, or use --dry-run.")]
    MissingDatabaseUrl,

    #[error("Invalid timestamp '{0}'. Expected RFC 3339, e.g. 2024-05-01T00:00:00Z.")]
    InvalidTimestamp(String),

    #[error("Failed to write run report: {0}")]
    Report(LiftError),

    #[error("Failed to serialize output: {0}")]
    Serialize(String),

    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    /// Cleanup finished with failed or blocked tables
    #[error("Rollback incomplete: {0}. Re-run the same command to retry the remaining tables.")]
    Incomplete(String),
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Serialize(e.to_string())
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(e: toml::ser::Error) -> Self {
        CliError::Serialize(e.to_string())
    }
}
