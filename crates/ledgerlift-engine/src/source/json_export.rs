//! Source backed by a directory of JSON export files
//!
//! Each `<resource>.json` file holds either an array of documents or an
//! object keyed by document id (the usual document-store export shape; the
//! key becomes the `id` field). Nested child collections stay inline and are
//! also indexed by parent id so [`SourceStore::fetch_children`] can serve
//! them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{page_by_offset, Cursor, Page, SourceStore};
use crate::error::SourceError;
use crate::model::SourceRecord;

#[derive(Debug, Clone)]
pub struct JsonExportSource {
    dir: PathBuf,
    resources: BTreeMap<String, Vec<SourceRecord>>,
    children: HashMap<(String, String), Vec<SourceRecord>>,
}

impl JsonExportSource {
    /// Load every `*.json` file in `dir`, indexing the given child collection
    /// names
    pub async fn open(dir: impl AsRef<Path>, child_types: &[String]) -> Result<Self, SourceError> {
        let dir = dir.as_ref().to_path_buf();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SourceError::Io(format!("{}: {e}", dir.display())))?;

        let mut resources = BTreeMap::new();
        let mut children = HashMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::Io(format!("{}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(resource) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))?;
            let records = parse_export(&text)
                .map_err(|e| SourceError::Malformed(format!("{}: {e}", path.display())))?;

            for record in &records {
                let Some(id) = record.id() else { continue };
                for child_type in child_types {
                    if let Some(Value::Array(items)) = record.fields().get(child_type) {
                        let nested = items.iter().cloned().filter_map(SourceRecord::from_value).collect();
                        children.insert((id.clone(), child_type.clone()), nested);
                    }
                }
            }

            debug!(resource = %resource, records = records.len(), "Loaded export file");
            resources.insert(resource, records);
        }

        info!(dir = %dir.display(), resources = resources.len(), "Opened JSON export");
        Ok(Self {
            dir,
            resources,
            children,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

fn parse_export(text: &str) -> Result<Vec<SourceRecord>, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| SourceRecord::from_value(item).ok_or_else(|| format!("element {i} is not an object")))
            .collect(),
        Value::Object(docs) => docs
            .into_iter()
            .map(|(id, doc)| match doc {
                Value::Object(mut fields) => {
                    fields.entry("id").or_insert(Value::String(id));
                    Ok(SourceRecord::new(fields))
                },
                _ => Err(format!("document {id} is not an object")),
            })
            .collect(),
        _ => Err("expected an array or an object of documents".to_string()),
    }
}

#[async_trait]
impl SourceStore for JsonExportSource {
    async fn fetch_page(
        &self,
        resource: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page, SourceError> {
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
        Ok(self
            .children
            .get(&(record_id.to_string(), child_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
