//! Core record types: what comes out of the source, what goes into the target

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Row as exchanged with the target store: column name -> JSON value
pub type Row = Map<String, Value>;

/// Field injected into flattened child records, holding the parent document
pub const PARENT_FIELD: &str = "_parent";

/// Record fetched from the document store. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRecord {
    fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build from a JSON value; non-objects are rejected
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Document id as assigned by the source store
    pub fn id(&self) -> Option<String> {
        self.fields.get("id").and_then(scalar_to_string)
    }

    /// Look up a dotted path such as `billing_address.city`.
    /// Null values are treated as absent.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// First present value among alternative field paths
    pub fn first_of<'a>(&'a self, paths: &[String]) -> Option<&'a Value> {
        paths.iter().find_map(|p| self.get_path(p))
    }

    /// First alternative that yields a non-blank scalar, as a string
    pub fn first_string(&self, paths: &[String]) -> Option<String> {
        paths
            .iter()
            .filter_map(|p| self.get_path(p))
            .filter_map(scalar_to_string)
            .find(|s| !s.trim().is_empty())
    }

    /// Copy of this record with a new field set; used to attach children
    /// and parent context during extraction.
    pub fn with_field(&self, key: impl Into<String>, value: Value) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(key.into(), value);
        Self { fields }
    }

    /// Copy of this record without the given fields
    pub fn without_fields(&self, keys: &[String]) -> Self {
        let mut fields = self.fields.clone();
        for key in keys {
            fields.remove(key);
        }
        Self { fields }
    }
}

/// Render a JSON scalar as text; objects and arrays yield `None`
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Primary key of a row in the target store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the `id` column from a returned row
    pub fn from_row(row: &Row) -> Option<Self> {
        row.get("id").and_then(scalar_to_string).map(Self)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Value restricted to the canonical semantic types
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    /// ISO-8601 UTC timestamp, millisecond precision
    Timestamp(String),
    /// Value drawn from a declared enum table
    Enum(String),
    List(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CanonicalValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CanonicalValue::Text(s) | CanonicalValue::Timestamp(s) | CanonicalValue::Enum(s) => {
                Some(s)
            },
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            CanonicalValue::Decimal(d) => Some(d),
            _ => None,
        }
    }

    /// Wire form for the target store. Decimals travel as strings so no
    /// precision is lost on the way into numeric columns.
    pub fn to_json(&self) -> Value {
        match self {
            CanonicalValue::Null => Value::Null,
            CanonicalValue::Text(s) | CanonicalValue::Timestamp(s) | CanonicalValue::Enum(s) => {
                Value::String(s.clone())
            },
            CanonicalValue::Integer(i) => Value::from(*i),
            CanonicalValue::Decimal(d) => Value::String(d.to_string()),
            CanonicalValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            CanonicalValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Normalized record ready for insertion into `table`
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEntity {
    pub table: String,
    pub source_id: String,
    pub fields: BTreeMap<String, CanonicalValue>,
}

impl CanonicalEntity {
    pub fn new(table: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_id: source_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CanonicalValue> {
        self.fields.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: CanonicalValue) {
        self.fields.insert(column.into(), value);
    }

    /// True when the column is present and non-null
    pub fn has_value(&self, column: &str) -> bool {
        self.fields.get(column).is_some_and(|v| !v.is_null())
    }

    pub fn to_row(&self) -> Row {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}
