//! Normalizer: heterogeneous source fields -> canonical values
//!
//! Pure functions only; nothing here performs I/O or fails. Malformed input
//! becomes the column's declared default (null, `0`, or the enum default).

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::{EnumTable, FieldKind, FieldRule, TableSpec};
use crate::model::{CanonicalEntity, CanonicalValue, SourceRecord};

/// Maps source records onto canonical entities using the enum tables of one
/// configuration
#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    enums: &'a BTreeMap<String, EnumTable>,
}

impl<'a> Normalizer<'a> {
    pub fn new(enums: &'a BTreeMap<String, EnumTable>) -> Self {
        Self { enums }
    }

    /// Build the canonical entity for `record` according to `spec`.
    ///
    /// Only the mapped columns are produced. The source key column is set to
    /// `source_id`; foreign keys and the tenant column are filled in later by
    /// the pipeline.
    pub fn normalize(
        &self,
        record: &SourceRecord,
        spec: &TableSpec,
        source_id: &str,
    ) -> CanonicalEntity {
        let mut entity = CanonicalEntity::new(&spec.name, source_id);
        for rule in &spec.fields {
            entity.set(&rule.column, self.field(record, rule));
        }
        entity.set(
            &spec.source_key_column,
            CanonicalValue::Text(source_id.to_string()),
        );
        entity
    }

    fn field(&self, record: &SourceRecord, rule: &FieldRule) -> CanonicalValue {
        let paths = rule.source_paths();
        match &rule.kind {
            FieldKind::Text => record
                .first_string(&paths)
                .map(|s| CanonicalValue::Text(s.trim().to_string()))
                .unwrap_or(CanonicalValue::Null),
            FieldKind::Integer { additive, default } => {
                match record.first_of(&paths).and_then(normalize_integer) {
                    Some(i) => CanonicalValue::Integer(i),
                    None if *additive => CanonicalValue::Integer(0),
                    None => default.map_or(CanonicalValue::Null, CanonicalValue::Integer),
                }
            },
            FieldKind::Decimal { additive } => {
                match record.first_of(&paths).and_then(normalize_decimal) {
                    Some(d) => CanonicalValue::Decimal(d),
                    None if *additive => CanonicalValue::Decimal(BigDecimal::zero()),
                    None => CanonicalValue::Null,
                }
            },
            // Alternatives are tried in order; a present but malformed value
            // does not stop the fallback.
            FieldKind::Timestamp => paths
                .iter()
                .filter_map(|p| record.get_path(p))
                .find_map(normalize_timestamp)
                .map(CanonicalValue::Timestamp)
                .unwrap_or(CanonicalValue::Null),
            FieldKind::Enum { table } => {
                let raw = record.first_string(&paths);
                match self.enums.get(table) {
                    Some(mapping) => CanonicalValue::Enum(mapping.map(raw.as_deref()).to_string()),
                    None => CanonicalValue::Null,
                }
            },
            FieldKind::NetOf {
                total,
                deductions,
                amount_field,
            } => {
                let total = record
                    .get_path(total)
                    .and_then(normalize_decimal)
                    .unwrap_or_else(BigDecimal::zero);
                let deducted = record
                    .get_path(deductions)
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| item.get(amount_field))
                            .filter_map(normalize_decimal)
                            .fold(BigDecimal::zero(), |acc, d| acc + d)
                    })
                    .unwrap_or_else(BigDecimal::zero);
                CanonicalValue::Decimal(total - deducted)
            },
            FieldKind::Constant { value } => CanonicalValue::Text(value.clone()),
            FieldKind::Document => record
                .first_of(&paths)
                .map(normalize_document)
                .unwrap_or(CanonicalValue::Null),
            FieldKind::List { fields } => match record.first_of(&paths) {
                Some(Value::Array(items)) => CanonicalValue::List(
                    items
                        .iter()
                        .filter_map(|item| SourceRecord::from_value(item.clone()))
                        .map(|item| {
                            CanonicalValue::Map(
                                fields
                                    .iter()
                                    .map(|f| (f.column.clone(), self.field(&item, f)))
                                    .collect(),
                            )
                        })
                        .collect(),
                ),
                _ => CanonicalValue::List(Vec::new()),
            },
        }
    }
}

/// Normalize any supported timestamp encoding to
/// `YYYY-MM-DDTHH:MM:SS.mmmZ`; `None` when absent or malformed.
///
/// Accepted encodings:
/// - `{ "_seconds": i64, "_nanoseconds": u32 }` or `{ "seconds", "nanoseconds" }`
/// - `{ "timestampValue": "<RFC 3339>" }`
/// - RFC 3339 strings, offsets without colon, naive date-times (taken as UTC)
///   and date-only strings (midnight UTC)
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    let parsed = match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Object(map) => {
            if let Some(inner) = map.get("timestampValue") {
                return normalize_timestamp(inner);
            }
            let seconds = map.get("_seconds").or_else(|| map.get("seconds"))?;
            let nanos = map
                .get("_nanoseconds")
                .or_else(|| map.get("nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let seconds = seconds
                .as_i64()
                .or_else(|| seconds.as_str().and_then(|s| s.parse().ok()))?;
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        },
        _ => None,
    }?;
    Some(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a number or numeric string as a decimal
pub fn normalize_decimal(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                None
            } else {
                BigDecimal::from_str(&cleaned).ok()
            }
        },
        _ => None,
    }
}

/// Parse as an integer; decimal input truncates toward zero
pub fn normalize_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    normalize_decimal(value).and_then(|d| d.with_scale(0).to_i64())
}

/// Recursively normalize a free-form document.
///
/// Timestamp encodings anywhere in the tree become canonical timestamps;
/// whole numbers stay integers, other numbers become decimals and booleans
/// become the strings `"true"` / `"false"`.
pub fn normalize_document(value: &Value) -> CanonicalValue {
    match value {
        Value::Null => CanonicalValue::Null,
        Value::Bool(b) => CanonicalValue::Text(b.to_string()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CanonicalValue::Integer(i),
            None => normalize_decimal(value)
                .map(CanonicalValue::Decimal)
                .unwrap_or(CanonicalValue::Null),
        },
        Value::String(s) => CanonicalValue::Text(s.clone()),
        Value::Array(items) => CanonicalValue::List(items.iter().map(normalize_document).collect()),
        Value::Object(map) => {
            if is_timestamp_object(map) {
                return normalize_timestamp(value)
                    .map(CanonicalValue::Timestamp)
                    .unwrap_or(CanonicalValue::Null);
            }
            CanonicalValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_document(v)))
                    .collect(),
            )
        },
    }
}

fn is_timestamp_object(map: &serde_json::Map<String, Value>) -> bool {
    map.contains_key("timestampValue")
        || ((map.contains_key("_seconds") || map.contains_key("seconds"))
            && map.len() <= 2
            && map
                .keys()
                .all(|k| matches!(k.as_str(), "_seconds" | "_nanoseconds" | "seconds" | "nanoseconds")))
}

/// Source id of a record: the first non-blank alternative
pub fn source_id_of(record: &SourceRecord, spec: &TableSpec) -> Option<String> {
    record
        .first_string(&spec.source_id_fields)
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_enums, default_tables};
    use serde_json::json;

    fn record(value: Value) -> SourceRecord {
        SourceRecord::from_value(value).unwrap()
    }

    fn table(name: &str) -> TableSpec {
        default_tables().into_iter().find(|t| t.name == name).unwrap()
    }

    #[test]
    fn test_epoch_pair_and_iso_string_agree() {
        let epoch = normalize_timestamp(&json!({"_seconds": 1700000000, "_nanoseconds": 0}));
        let iso = normalize_timestamp(&json!("2023-11-14T22:13:20.000Z"));
        assert_eq!(epoch.as_deref(), Some("2023-11-14T22:13:20.000Z"));
        assert_eq!(epoch, iso);
    }

    #[test]
    fn test_timestamp_variants() {
        assert_eq!(
            normalize_timestamp(&json!({"seconds": 1700000000, "nanoseconds": 123000000})).as_deref(),
            Some("2023-11-14T22:13:20.123Z")
        );
        assert_eq!(
            normalize_timestamp(&json!({"timestampValue": "2023-11-14T23:13:20+01:00"})).as_deref(),
            Some("2023-11-14T22:13:20.000Z")
        );
        assert_eq!(
            normalize_timestamp(&json!("2023-11-14T22:13:20+0000")).as_deref(),
            Some("2023-11-14T22:13:20.000Z")
        );
        assert_eq!(
            normalize_timestamp(&json!("2023-11-14")).as_deref(),
            Some("2023-11-14T00:00:00.000Z")
        );
        assert_eq!(normalize_timestamp(&json!("not a date")), None);
        assert_eq!(normalize_timestamp(&json!(42)), None);
        assert_eq!(normalize_timestamp(&json!("")), None);
    }

    #[test]
    fn test_decimal_and_integer_parsing() {
        assert_eq!(
            normalize_decimal(&json!("1,250.75")),
            Some(BigDecimal::from_str("1250.75").unwrap())
        );
        assert_eq!(normalize_decimal(&json!("n/a")), None);
        assert_eq!(normalize_integer(&json!(7)), Some(7));
        assert_eq!(normalize_integer(&json!("3.9")), Some(3));
        assert_eq!(normalize_integer(&json!(-2.5)), Some(-2));
        assert_eq!(normalize_integer(&json!(true)), None);
    }

    #[test]
    fn test_unknown_status_maps_to_default() {
        let enums = default_enums();
        let normalizer = Normalizer::new(&enums);
        let entity = normalizer.normalize(
            &record(json!({"salesorder_number": "SO-1", "order_status": "teleported"})),
            &table("orders"),
            "SO-1",
        );
        assert_eq!(
            entity.get("order_status"),
            Some(&CanonicalValue::Enum("pending".to_string()))
        );
    }

    #[test]
    fn test_additive_defaults_and_net_of_taxes() {
        let enums = default_enums();
        let normalizer = Normalizer::new(&enums);
        let entity = normalizer.normalize(
            &record(json!({
                "salesorder_number": "SO-9",
                "total": "120.00",
                "taxes": [{"tax_amount": 15.5}, {"tax_amount": "4.5"}, {"tax_name": "none"}],
                "created_time": {"_seconds": 1700000000, "_nanoseconds": 0}
            })),
            &table("orders"),
            "SO-9",
        );
        assert_eq!(
            entity.get("sub_total").and_then(CanonicalValue::as_decimal),
            Some(&BigDecimal::from_str("100.00").unwrap())
        );
        assert_eq!(
            entity.get("updated_at"),
            Some(&CanonicalValue::Timestamp("2023-11-14T22:13:20.000Z".to_string()))
        );
        assert_eq!(
            entity.get("legacy_order_number"),
            Some(&CanonicalValue::Text("SO-9".to_string()))
        );

        let empty = normalizer.normalize(
            &record(json!({"invoice_id": "INV-1", "total": "abc"})),
            &table("invoices"),
            "INV-1",
        );
        assert_eq!(empty.get("total"), Some(&CanonicalValue::Decimal(BigDecimal::zero())));
        assert_eq!(empty.get("payment_terms"), Some(&CanonicalValue::Integer(30)));
        assert_eq!(empty.get("invoice_date"), Some(&CanonicalValue::Null));
        assert_eq!(
            empty.get("order_type"),
            Some(&CanonicalValue::Text("sales_order".to_string()))
        );
    }

    #[test]
    fn test_optional_metric_is_null_when_malformed() {
        let enums = default_enums();
        let normalizer = Normalizer::new(&enums);
        let entity = normalizer.normalize(
            &record(json!({"id": "c1", "total_spent": "lots"})),
            &table("customers"),
            "c1",
        );
        assert_eq!(entity.get("total_spent"), Some(&CanonicalValue::Null));
    }

    #[test]
    fn test_document_recursion_leaves_no_raw_timestamps() {
        let doc = normalize_document(&json!({
            "history": [
                {"at": {"_seconds": 1700000000, "_nanoseconds": 0}, "paid": true},
                {"at": {"timestampValue": "2023-11-14T22:13:20Z"}, "amount": 1.5}
            ]
        }));
        let CanonicalValue::Map(top) = doc else {
            panic!("expected map");
        };
        let CanonicalValue::List(items) = &top["history"] else {
            panic!("expected list");
        };
        for item in items {
            let CanonicalValue::Map(entry) = item else {
                panic!("expected map");
            };
            assert_eq!(
                entry["at"],
                CanonicalValue::Timestamp("2023-11-14T22:13:20.000Z".to_string())
            );
        }
        let CanonicalValue::Map(first) = &items[0] else {
            unreachable!()
        };
        assert_eq!(first["paid"], CanonicalValue::Text("true".to_string()));
    }

    #[test]
    fn test_source_id_prefers_first_alternative() {
        let spec = table("customers");
        assert_eq!(
            source_id_of(&record(json!({"firebase_uid": "fb-1", "id": "x"})), &spec).as_deref(),
            Some("fb-1")
        );
        assert_eq!(
            source_id_of(&record(json!({"firebase_uid": "", "id": "x"})), &spec).as_deref(),
            Some("x")
        );
        assert_eq!(source_id_of(&record(json!({"name": "anon"})), &spec), None);
    }
}
