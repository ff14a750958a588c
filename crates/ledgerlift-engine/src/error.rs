//! Error types for the migration engine
//!
//! Collaborator failures are split by side ([`SourceError`], [`TargetError`])
//! and classified as transient or permanent, which drives the retry policy.
//! [`EngineError`] covers everything that stops a run or a cleanup from
//! starting at all; cancellation is not an error and is recorded in the
//! run report instead.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by the relational target store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// Throughput limit hit; safe to retry after backing off
    #[error("Target rate limited: {0}")]
    RateLimited(String),

    /// Network or connection-level failure; safe to retry
    #[error("Transient target failure: {0}")]
    Transient(String),

    /// Foreign key, uniqueness or not-null violation; retrying cannot help
    #[error("Constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    /// Anything else the store rejected (bad identifier, unknown table, ...)
    #[error("Target error: {0}")]
    Other(String),
}

impl TargetError {
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        TargetError::Constraint {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether a retry after backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TargetError::RateLimited(_) | TargetError::Transient(_))
    }
}

/// Failure reported by the document-store source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source rate limited: {0}")]
    RateLimited(String),

    #[error("Transient source failure: {0}")]
    Transient(String),

    #[error("Unknown source resource: {0}")]
    UnknownResource(String),

    #[error("Malformed source data: {0}")]
    Malformed(String),

    #[error("Source IO error: {0}")]
    Io(String),
}

impl SourceError {
    /// Whether a retry after backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::Transient(_))
    }
}

/// Errors that prevent a run or cleanup from proceeding
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dependency cycle between tables: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] ledgerlift_common::LiftError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_error_classification() {
        assert!(TargetError::RateLimited("429".into()).is_transient());
        assert!(TargetError::Transient("connection reset".into()).is_transient());
        assert!(!TargetError::constraint("orders", "fk_customer").is_transient());
        assert!(!TargetError::Other("bad identifier".into()).is_transient());
    }

    #[test]
    fn test_source_error_classification() {
        assert!(SourceError::RateLimited("quota".into()).is_transient());
        assert!(!SourceError::UnknownResource("widgets".into()).is_transient());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = EngineError::DependencyCycle(vec![
            "orders".to_string(),
            "invoices".to_string(),
            "orders".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Dependency cycle between tables: orders -> invoices -> orders"
        );
    }
}
