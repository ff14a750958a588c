//! Extraction: page through a resource with retry, attach child
//! collections, stop cleanly on cancellation or exhausted retries.
//!
//! Records fetched before an early stop are kept and, when a checkpoint
//! directory is configured, written to `<dir>/<resource>.partial.jsonl`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{Cursor, SourceStore};
use crate::config::RetryPolicy;
use crate::error::{Result, SourceError};
use crate::model::SourceRecord;
use crate::retry::with_retry;

/// Outcome of extracting one resource
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub resource: String,
    pub records: Vec<SourceRecord>,
    pub pages: usize,
    /// All pages were fetched
    pub complete: bool,
    pub cancelled: bool,
    /// Error that ended extraction early
    pub error: Option<SourceError>,
    pub checkpoint: Option<PathBuf>,
    pub retries: u32,
    /// Records kept without (all of) their child collections because a
    /// child fetch failed
    pub children_missing: usize,
}

impl Extraction {
    pub fn summary(&self) -> ExtractionSummary {
        ExtractionSummary {
            resource: self.resource.clone(),
            records: self.records.len(),
            pages: self.pages,
            complete: self.complete,
            cancelled: self.cancelled,
            error: self.error.as_ref().map(ToString::to_string),
            checkpoint: self.checkpoint.clone(),
            retries: self.retries,
            children_missing: self.children_missing,
        }
    }
}

/// Report form of an [`Extraction`], without the records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub resource: String,
    pub records: usize,
    pub pages: usize,
    pub complete: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub checkpoint: Option<PathBuf>,
    pub retries: u32,
    #[serde(default)]
    pub children_missing: usize,
}

pub struct Extractor<'a> {
    source: &'a dyn SourceStore,
    page_size: usize,
    retry: RetryPolicy,
    checkpoint_dir: Option<&'a Path>,
    cancel: CancellationToken,
}

impl<'a> Extractor<'a> {
    pub fn new(source: &'a dyn SourceStore, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            source,
            page_size,
            retry,
            checkpoint_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpoint_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.checkpoint_dir = dir;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch every page of `resource`. Each record with an id gets its child
    /// collections attached under the child type name.
    #[instrument(skip(self, child_types))]
    pub async fn extract(&self, resource: &str, child_types: &[String]) -> Result<Extraction> {
        let mut extraction = Extraction {
            resource: resource.to_string(),
            ..Extraction::default()
        };
        let mut cursor: Option<Cursor> = None;

        loop {
            if self.cancel.is_cancelled() {
                warn!(resource, pages = extraction.pages, "Extraction cancelled");
                extraction.cancelled = true;
                break;
            }

            let label = format!("Fetch {} page {}", resource, extraction.pages + 1);
            let outcome = with_retry(&self.retry, &label, |_| {
                self.source.fetch_page(resource, self.page_size, cursor.as_ref())
            })
            .await;
            extraction.retries += outcome.retries();

            let page = match outcome.result {
                Ok(page) => page,
                Err(e) => {
                    warn!(resource, pages = extraction.pages, error = %e, "Extraction stopped early");
                    extraction.error = Some(e);
                    break;
                },
            };

            let mut records = Vec::with_capacity(page.records.len());
            let mut child_error: Option<SourceError> = None;
            for record in page.records {
                let mut record = record;
                // After a child failure the rest of the page is kept as is
                if child_error.is_some() {
                    if record.id().is_some() && !child_types.is_empty() {
                        extraction.children_missing += 1;
                    }
                    records.push(record);
                    continue;
                }
                if let Some(id) = record.id() {
                    for child_type in child_types {
                        let label = format!("Fetch {child_type} of {id}");
                        let outcome =
                            with_retry(&self.retry, &label, |_| self.source.fetch_children(&id, child_type)).await;
                        extraction.retries += outcome.retries();
                        match outcome.result {
                            Ok(children) => {
                                let children = children.into_iter().map(|c| Value::Object(c.into_fields())).collect();
                                record = record.with_field(child_type.clone(), Value::Array(children));
                            },
                            Err(e) => {
                                warn!(resource, record = %id, child_type = %child_type, error = %e, "Child fetch failed");
                                child_error = Some(e);
                                extraction.children_missing += 1;
                                break;
                            },
                        }
                    }
                }
                records.push(record);
            }
            if let Some(e) = child_error {
                warn!(
                    resource,
                    pages = extraction.pages,
                    kept = records.len(),
                    "Extraction stopped early after a child fetch failure"
                );
                extraction.records.extend(records);
                extraction.error = Some(e);
                break;
            }

            extraction.records.extend(records);
            extraction.pages += 1;

            match page.next {
                Some(next) => cursor = Some(next),
                None => {
                    extraction.complete = true;
                    break;
                },
            }
        }

        if !extraction.complete {
            if let Some(dir) = self.checkpoint_dir {
                let path = write_checkpoint(dir, resource, &extraction.records)?;
                info!(resource, records = extraction.records.len(), path = %path.display(), "Checkpoint written");
                extraction.checkpoint = Some(path);
            }
        } else {
            info!(resource, records = extraction.records.len(), pages = extraction.pages, "Extraction complete");
        }

        Ok(extraction)
    }
}

/// Write already-fetched records as JSON lines; the file is opened, written
/// and closed within this call
pub fn write_checkpoint(dir: &Path, resource: &str, records: &[SourceRecord]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{resource}.partial.jsonl"));
    serde_jsonlines::write_json_lines(&path, records)?;
    Ok(path)
}

/// Read a checkpoint back
pub fn read_checkpoint(path: &Path) -> std::io::Result<Vec<SourceRecord>> {
    serde_jsonlines::json_lines(path)?.collect()
}
