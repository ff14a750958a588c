//! Relational target store contract
//!
//! The engine talks to the target through [`TargetStore`] only. Two
//! implementations ship with the crate:
//!
//! - [`memory::MemoryStore`]: in-process tables with foreign key enforcement,
//!   used by tests and dry runs
//! - `postgres::PgTargetStore`: PostgreSQL through sqlx (`postgres` feature)

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TargetError;
use crate::model::{Row, TargetId};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTargetStore;

/// Row predicate understood by every target store.
///
/// Values are compared in their text form, which matches how identifiers and
/// source keys are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
    /// `column >= at`
    Since { column: String, at: DateTime<Utc> },
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn ids(ids: &[TargetId]) -> Self {
        Filter::In {
            column: "id".to_string(),
            values: ids.iter().map(|id| id.as_str().to_string()).collect(),
        }
    }

    /// Combine with another predicate, flattening nested conjunctions
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            },
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            },
            (f, g) => Filter::And(vec![f, g]),
        }
    }
}

/// Columns to return from a select
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Fields(Vec<String>),
    /// Return only the number of matching rows
    CountOnly,
}

impl Projection {
    pub fn fields(columns: &[&str]) -> Self {
        Projection::Fields(columns.iter().map(|c| c.to_string()).collect())
    }
}

/// Result of a select
#[derive(Debug, Clone, PartialEq)]
pub enum Selected {
    Rows(Vec<Row>),
    Count(u64),
}

impl Selected {
    pub fn count(&self) -> u64 {
        match self {
            Selected::Rows(rows) => rows.len() as u64,
            Selected::Count(n) => *n,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Selected::Rows(rows) => rows,
            Selected::Count(_) => Vec::new(),
        }
    }
}

/// Relational store with enforced foreign keys
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert all rows in one operation and return the stored rows, each
    /// carrying its assigned `id`. Implementations are all-or-nothing; a
    /// store that returns fewer rows than it was given reports a partial
    /// write.
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<Vec<Row>, TargetError>;

    /// Delete rows by primary key; absent ids are ignored
    async fn delete_where(&self, table: &str, ids: &[TargetId]) -> Result<u64, TargetError>;

    /// Select matching rows in a stable order (ascending `id` for SQL stores,
    /// insertion order for the memory store)
    async fn select_where(
        &self,
        table: &str,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Selected, TargetError>;
}
