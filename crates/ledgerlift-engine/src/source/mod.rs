//! Document-store source contract and extraction
//!
//! The source is an external collaborator: it pages through the records of
//! one resource type and can return the nested child collection of a record.
//! [`extract::Extractor`] drives it with retry, cancellation and
//! checkpointing.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::model::SourceRecord;

pub mod extract;
pub mod json_export;
pub mod memory;

pub use extract::{Extraction, Extractor};
pub use json_export::JsonExportSource;
pub use memory::MemorySource;

/// Opaque pagination cursor handed back to the source unchanged
pub type Cursor = String;

/// One page of records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    /// `None` when the resource is exhausted
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch up to `page_size` records of `resource`, starting at `cursor`
    /// (`None` for the first page)
    async fn fetch_page(
        &self,
        resource: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page, SourceError>;

    /// Nested child records of one record, e.g. the line items of an order
    async fn fetch_children(
        &self,
        record_id: &str,
        child_type: &str,
    ) -> Result<Vec<SourceRecord>, SourceError>;
}

/// Slice `records` into a page using a numeric offset cursor
pub(crate) fn page_by_offset(
    records: &[SourceRecord],
    page_size: usize,
    cursor: Option<&Cursor>,
) -> Result<Page, SourceError> {
    let start = match cursor {
        None => 0,
        Some(c) => c
            .parse::<usize>()
            .map_err(|_| SourceError::Malformed(format!("invalid cursor: {c}")))?,
    };
    let total = records.len();
    let end = start.saturating_add(page_size.max(1)).min(total);
    let page = records.get(start..end).map(<[SourceRecord]>::to_vec).unwrap_or_default();
    let next = (end < total).then(|| end.to_string());
    Ok(Page {
        records: page,
        next,
    })
}
