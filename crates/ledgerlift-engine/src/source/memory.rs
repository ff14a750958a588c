//! In-memory source with scriptable page failures

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::{page_by_offset, Cursor, Page, SourceStore};
use crate::error::SourceError;
use crate::model::SourceRecord;

#[derive(Debug, Default)]
pub struct MemorySource {
    resources: BTreeMap<String, Vec<SourceRecord>>,
    children: HashMap<(String, String), Vec<SourceRecord>>,
    /// Per resource, outcome of the next fetches: `None` lets the fetch
    /// through, `Some(err)` fails it
    script: Mutex<HashMap<String, VecDeque<Option<SourceError>>>>,
    /// Per record id, errors returned by the next child fetches
    child_failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, resource: &str, records: Vec<SourceRecord>) -> Self {
        self.resources
            .entry(resource.to_string())
            .or_default()
            .extend(records);
        self
    }

    pub fn with_children(mut self, record_id: &str, child_type: &str, records: Vec<SourceRecord>) -> Self {
        self.children
            .insert((record_id.to_string(), child_type.to_string()), records);
        self
    }

    /// Fail the next unscripted fetch of `resource`
    pub fn push_page_failure(&self, resource: &str, error: SourceError) {
        self.push(resource, Some(error));
    }

    /// Let the next fetch of `resource` through; used to place failures after
    /// a number of good pages
    pub fn push_page_success(&self, resource: &str) {
        self.push(resource, None);
    }

    /// Fail the next child fetch of `record_id`, whatever the child type
    pub fn push_children_failure(&self, record_id: &str, error: SourceError) {
        if let Ok(mut failures) = self.child_failures.lock() {
            failures.entry(record_id.to_string()).or_default().push_back(error);
        }
    }

    fn push(&self, resource: &str, outcome: Option<SourceError>) {
        if let Ok(mut script) = self.script.lock() {
            script.entry(resource.to_string()).or_default().push_back(outcome);
        }
    }

    /// Number of `fetch_page` calls made for `resource`
    pub fn fetches(&self, resource: &str) -> usize {
        self.fetches
            .lock()
            .ok()
            .and_then(|f| f.get(resource).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn fetch_page(
        &self,
        resource: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page, SourceError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            *fetches.entry(resource.to_string()).or_insert(0) += 1;
        }
        let scripted = self
            .script
            .lock()
            .map_err(|_| SourceError::Io("memory source lock poisoned".to_string()))?
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .flatten();
        if let Some(error) = scripted {
            return Err(error);
        }

        let records = self
            .resources
            .get(resource)
            .ok_or_else(|| SourceError::UnknownResource(resource.to_string()))?;
        page_by_offset(records, page_size, cursor)
    }

    async fn fetch_children(
        &self,
        record_id: &str,
        child_type: &str,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let scripted = self
            .child_failures
            .lock()
            .map_err(|_| SourceError::Io("memory source lock poisoned".to_string()))?
            .get_mut(record_id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        Ok(self
            .children
            .get(&(record_id.to_string(), child_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
