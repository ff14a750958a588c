//! Shared fixtures for engine integration tests
//!
//! A small ledger export: two customers, three sales orders (one referring to
//! its customer only by name), three line items and two invoices.

#![allow(dead_code)]

#[cfg(feature = "postgres")]
pub mod postgres;

use ledgerlift_engine::config::MigrationConfig;
use ledgerlift_engine::graph::DependencyGraph;
use ledgerlift_engine::model::{Row, SourceRecord};
use ledgerlift_engine::source::MemorySource;
use ledgerlift_engine::target::MemoryStore;
use serde_json::{json, Value};

pub const TENANT_ID: &str = "87dcc6db-2e24-46fb-9a12-7886f690a326";
pub const OTHER_TENANT_ID: &str = "0c1f4b44-3f5e-4d8e-9a51-2b7f0a9d1e77";

/// Install a test subscriber once; repeated calls are harmless
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ledgerlift_engine=debug")
        .with_test_writer()
        .try_init();
}

pub fn config() -> MigrationConfig {
    MigrationConfig {
        tenant_id: TENANT_ID.to_string(),
        batch_size: 2,
        page_size: 2,
        ..MigrationConfig::default()
    }
}

pub fn graph() -> DependencyGraph {
    config().validate().expect("default config is valid")
}

pub fn empty_store() -> MemoryStore {
    MemoryStore::new(graph())
}

pub fn record(value: Value) -> SourceRecord {
    SourceRecord::from_value(value).expect("fixture must be an object")
}

pub fn customers() -> Vec<SourceRecord> {
    vec![
        record(json!({
            "firebase_uid": "fb-1",
            "display_name": "Acme Ltd",
            "email": "ops@acme.test",
            "billing_address": {"city": "Leeds", "zip": "LS1 4AP"},
            "created_time": "2023-04-01T10:00:00Z"
        })),
        record(json!({
            "firebase_uid": "fb-2",
            "display_name": "Brightside Cafe",
            "created_time": {"_seconds": 1_680_343_200i64, "_nanoseconds": 0}
        })),
    ]
}

pub fn sales_orders() -> Vec<SourceRecord> {
    vec![
        record(json!({
            "id": "doc-so1",
            "salesorder_number": "SO-1",
            "customer_id": "fb-1",
            "status": "confirmed",
            "date": "2023-04-02",
            "total": "120.00",
            "taxes": [{"tax_name": "VAT", "tax_amount": "20.00"}]
        })),
        record(json!({
            "id": "doc-so2",
            "salesorder_number": "SO-2",
            "customer_id": "fb-2",
            "status": "closed",
            "total": 45
        })),
        record(json!({
            "id": "doc-so3",
            "salesorder_number": "SO-3",
            "customer_name": "  acme LTD ",
            "status": "on_hold",
            "total": "10.50"
        })),
    ]
}

pub fn line_items(order_doc: &str) -> Vec<SourceRecord> {
    match order_doc {
        "doc-so1" => vec![
            record(json!({"line_item_id": "L-1", "name": "Widget", "quantity": 2, "rate": "50.00", "item_total": "100.00"})),
            record(json!({"line_item_id": "L-2", "name": "Delivery", "quantity": 1, "rate": "20.00", "item_total": "20.00"})),
        ],
        "doc-so2" => vec![record(json!({"line_item_id": "L-3", "name": "Flat white", "quantity": "3"}))],
        _ => Vec::new(),
    }
}

pub fn invoices() -> Vec<SourceRecord> {
    vec![
        record(json!({
            "invoice_id": "INV-1",
            "customer_id": "fb-1",
            "salesorder_number": "SO-1",
            "status": "paid",
            "total": "120.00",
            "balance": "0"
        })),
        record(json!({
            "invoice_id": "INV-2",
            "customer_id": "fb-2",
            "status": "viewed",
            "total": "45",
            "balance": "45"
        })),
    ]
}

/// The whole export, with line items served as children of their orders
pub fn ledger_source() -> MemorySource {
    MemorySource::new()
        .with_records("customers", customers())
        .with_records("sales_orders", sales_orders())
        .with_records("invoices", invoices())
        .with_children("doc-so1", "order_line_items", line_items("doc-so1"))
        .with_children("doc-so2", "order_line_items", line_items("doc-so2"))
}

/// Find the stored row whose `column` equals `value`
pub fn row_by<'a>(rows: &'a [Row], column: &str, value: &str) -> Option<&'a Row> {
    rows.iter()
        .find(|r| r.get(column).and_then(Value::as_str) == Some(value))
}

pub fn id_of(row: &Row) -> &str {
    row.get("id").and_then(Value::as_str).unwrap_or_default()
}
