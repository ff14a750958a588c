//! End-to-end migration runs against the in-memory stores

mod common;

use bigdecimal::BigDecimal;
use common::*;
use ledgerlift_engine::report::RunReport;
use ledgerlift_engine::source::MemorySource;
use ledgerlift_engine::{pipeline::MigrationRun, EngineError, SourceError, TargetError};
use serde_json::{json, Value};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

fn decimal(row: &ledgerlift_engine::model::Row, column: &str) -> BigDecimal {
    let raw = row.get(column).and_then(Value::as_str).unwrap_or("NaN");
    BigDecimal::from_str(raw).unwrap()
}

#[tokio::test]
async fn test_full_run_migrates_every_table() {
    init_tracing();
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    assert_eq!(store.rows("customers").len(), 2);
    assert_eq!(store.rows("orders").len(), 3);
    assert_eq!(store.rows("order_line_items").len(), 3);
    assert_eq!(store.rows("invoices").len(), 2);
    assert!(store.rows("shipments").is_empty());

    let report = &outcome.report;
    assert!(!report.cancelled);
    assert_eq!(report.totals.inserted, 10);
    assert_eq!(report.totals.insert_errors, 0);
    assert_eq!(report.target_row_counts["orders"], 3);
    assert_eq!(report.target_row_counts["shipments"], 0);
    assert!(report.table("shipments").is_none());
    assert!(report.flagged_tables.is_empty());
    assert_eq!(outcome.links.len(), 10);
}

#[tokio::test]
async fn test_orders_resolve_customers_directly_and_by_name() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let customers = store.rows("customers");
    let orders = store.rows("orders");
    let acme = id_of(row_by(&customers, "fb_customer_id", "fb-1").unwrap());
    let brightside = id_of(row_by(&customers, "fb_customer_id", "fb-2").unwrap());

    let customer_of = |order: &str| {
        row_by(&orders, "legacy_order_number", order)
            .and_then(|r| r.get("customer_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    assert_eq!(customer_of("SO-1").as_deref(), Some(acme));
    assert_eq!(customer_of("SO-2").as_deref(), Some(brightside));
    assert_eq!(customer_of("SO-3").as_deref(), Some(acme));

    let counters = outcome.report.table("orders").unwrap().counters;
    assert_eq!(counters.seen, 3);
    assert_eq!(counters.inserted, 3);
    assert_eq!(counters.skipped_no_identity, 0);
    assert_eq!(counters.skipped_no_required_fk, 0);
    assert_eq!(outcome.links.len_for("orders"), 3);
}

#[tokio::test]
async fn test_equivalent_timestamps_are_stored_identically() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let customers = store.rows("customers");
    let created = |uid: &str| row_by(&customers, "fb_customer_id", uid).unwrap()["created_at"].clone();
    assert_eq!(created("fb-1"), json!("2023-04-01T10:00:00.000Z"));
    assert_eq!(created("fb-1"), created("fb-2"));
}

#[tokio::test]
async fn test_values_are_normalized_on_the_way_in() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let orders = store.rows("orders");
    let so1 = row_by(&orders, "legacy_order_number", "SO-1").unwrap();
    assert_eq!(so1["order_status"], json!("confirmed"));
    assert_eq!(so1["company_id"], json!(TENANT_ID));
    assert_eq!(decimal(so1, "sub_total"), BigDecimal::from_str("100").unwrap());
    assert_eq!(so1["order_date"], json!("2023-04-02T00:00:00.000Z"));
    let so2 = row_by(&orders, "legacy_order_number", "SO-2").unwrap();
    assert_eq!(so2["order_status"], json!("delivered"));
    assert_eq!(decimal(so2, "sub_total"), BigDecimal::from(45));
    // Unknown status falls back to the table default
    let so3 = row_by(&orders, "legacy_order_number", "SO-3").unwrap();
    assert_eq!(so3["order_status"], json!("pending"));

    let items = store.rows("order_line_items");
    let l3 = row_by(&items, "legacy_line_item_id", "L-3").unwrap();
    assert_eq!(l3["quantity"], json!(3));
    assert_eq!(l3["quantity_packed"], json!(0));
    assert_eq!(decimal(l3, "unit_price"), BigDecimal::from(0));
    assert_eq!(l3["order_id"], json!(id_of(so2)));

    let invoices = store.rows("invoices");
    let inv2 = row_by(&invoices, "legacy_invoice_id", "INV-2").unwrap();
    assert_eq!(inv2["invoice_status"], json!("received"));
    assert_eq!(inv2["order_type"], json!("sales_order"));
    assert_eq!(inv2["payment_terms"], json!(30));
}

#[tokio::test]
async fn test_unresolved_optional_reference_is_written_as_null() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let orders = store.rows("orders");
    let invoices = store.rows("invoices");
    let inv1 = row_by(&invoices, "legacy_invoice_id", "INV-1").unwrap();
    let inv2 = row_by(&invoices, "legacy_invoice_id", "INV-2").unwrap();
    assert_eq!(inv1["order_id"], json!(id_of(row_by(&orders, "legacy_order_number", "SO-1").unwrap())));
    assert_eq!(inv2["order_id"], Value::Null);

    let counters = outcome.report.table("invoices").unwrap().counters;
    assert_eq!(counters.inserted, 2);
    assert_eq!(counters.unresolved_optional_fk, 1);
}

#[tokio::test]
async fn test_unresolved_required_reference_writes_nothing() {
    let config = config();
    let source = MemorySource::new()
        .with_records("customers", customers())
        .with_records(
            "sales_orders",
            vec![record(json!({"salesorder_number": "SO-9", "customer_id": "fb-404", "total": "5"}))],
        )
        .with_records("invoices", Vec::new());
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    assert!(store.rows("orders").is_empty());
    let counters = outcome.report.table("orders").unwrap().counters;
    assert_eq!(counters.seen, 1);
    assert_eq!(counters.skipped_no_required_fk, 1);
    assert_eq!(counters.inserted, 0);
    assert_eq!(counters.insert_errors, 0);
    assert_eq!(store.insert_attempts("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_failing_twice_then_succeeding_counts_as_inserted() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();
    store.push_insert_failure("customers", TargetError::Transient("connection reset".into()));
    store.push_insert_failure("customers", TargetError::RateLimited("too many requests".into()));

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let counters = outcome.report.table("customers").unwrap().counters;
    assert_eq!(counters.inserted, 2);
    assert_eq!(counters.insert_errors, 0);
    assert_eq!(counters.batch_retries, 2);
    assert_eq!(counters.batches_written, 1);
    assert_eq!(store.insert_attempts("customers"), 3);
    assert_eq!(store.rows("customers").len(), 2);
}

#[tokio::test]
async fn test_failed_batch_is_counted_and_the_run_continues() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();
    store.push_insert_failure("invoices", TargetError::constraint("invoices", "check_total"));

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let invoices = outcome.report.table("invoices").unwrap().counters;
    assert_eq!(invoices.insert_errors, 2);
    assert_eq!(invoices.batches_failed, 1);
    assert_eq!(invoices.batch_retries, 0);
    assert!(store.rows("invoices").is_empty());
    assert_eq!(store.rows("order_line_items").len(), 3);
}

#[tokio::test]
async fn test_rerun_inserts_nothing_twice() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    let first = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();
    let second = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    assert_eq!(second.report.totals.inserted, 0);
    assert_eq!(second.report.totals.already_migrated, 10);
    assert_eq!(store.rows("customers").len(), 2);
    assert_eq!(store.rows("orders").len(), 3);
    assert_eq!(store.rows("order_line_items").len(), 3);
    assert_eq!(second.report.target_row_counts, first.report.target_row_counts);

    for (table, source_id) in [("customers", "fb-1"), ("orders", "SO-3"), ("invoices", "INV-2")] {
        assert_eq!(first.links.get(table, source_id), second.links.get(table, source_id));
    }
}

#[tokio::test]
async fn test_records_without_identity_or_twice_seen_are_counted() {
    let config = config();
    let mut records = customers();
    records.push(record(json!({"display_name": "Nameless Traders"})));
    records.push(record(json!({"firebase_uid": "fb-1", "display_name": "Acme Ltd (copy)"})));
    let source = MemorySource::new()
        .with_records("customers", records)
        .with_records("sales_orders", Vec::new())
        .with_records("invoices", Vec::new());
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let counters = outcome.report.table("customers").unwrap().counters;
    assert_eq!(counters.seen, 4);
    assert_eq!(counters.inserted, 2);
    assert_eq!(counters.skipped_no_identity, 1);
    assert_eq!(counters.duplicates, 1);
    assert_eq!(outcome.report.flagged_tables, vec!["customers".to_string()]);
}

#[tokio::test]
async fn test_other_tenants_rows_are_not_matched() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();
    store
        .seed(
            "customers",
            vec![json!({"fb_customer_id": "fb-1", "linked_company": OTHER_TENANT_ID, "display_name": "Acme Ltd"})
                .as_object()
                .cloned()
                .unwrap()],
        )
        .unwrap();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let counters = outcome.report.table("customers").unwrap().counters;
    assert_eq!(counters.already_migrated, 0);
    assert_eq!(counters.inserted, 2);
    assert_eq!(outcome.report.target_row_counts["customers"], 2);
    assert_eq!(store.rows("customers").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_source_failure_keeps_fetched_pages_and_reports_them() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.page_size = 1;
    config.checkpoint_dir = Some(dir.path().to_path_buf());
    let source = ledger_source();
    source.push_page_success("customers");
    for _ in 0..config.retry.max_attempts {
        source.push_page_failure("customers", SourceError::Transient("deadline exceeded".into()));
    }
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let extraction = outcome
        .report
        .extractions
        .iter()
        .find(|e| e.resource == "customers")
        .unwrap();
    assert!(!extraction.complete);
    assert_eq!(extraction.records, 1);
    assert!(dir.path().join("customers.partial.jsonl").exists());
    assert_eq!(store.rows("customers").len(), 1);
}

#[tokio::test]
async fn test_child_fetch_failure_keeps_page_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.checkpoint_dir = Some(dir.path().to_path_buf());
    let source = ledger_source();
    source.push_children_failure("doc-so2", SourceError::Malformed("line items unreadable".into()));
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    // First page (doc-so1, doc-so2) is kept; doc-so3 sits on the unfetched second page
    let orders = outcome.report.table("orders").unwrap().counters;
    assert_eq!(orders.seen, 2);
    assert_eq!(orders.inserted, 2);
    assert!(row_by(&store.rows("orders"), "legacy_order_number", "SO-2").is_some());
    assert_eq!(outcome.report.table("order_line_items").unwrap().counters.inserted, 2);

    let extraction = outcome
        .report
        .extractions
        .iter()
        .find(|e| e.resource == "sales_orders")
        .unwrap();
    assert!(!extraction.complete);
    assert_eq!(extraction.records, 2);
    assert_eq!(extraction.children_missing, 1);
    let checkpoint = dir.path().join("sales_orders.partial.jsonl");
    assert_eq!(
        ledgerlift_engine::source::extract::read_checkpoint(&checkpoint).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_nested_items_that_are_not_objects_are_counted() {
    let config = config();
    // No document id, so the inline line items are used as exported
    let source = MemorySource::new()
        .with_records("customers", customers())
        .with_records(
            "sales_orders",
            vec![record(json!({
                "salesorder_number": "SO-7",
                "customer_id": "fb-1",
                "total": "10",
                "order_line_items": [
                    {"line_item_id": "L-7", "name": "Bolt", "quantity": 1},
                    "see attachment",
                    42
                ]
            }))],
        )
        .with_records("invoices", Vec::new());
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();

    let items = outcome.report.table("order_line_items").unwrap().counters;
    assert_eq!(items.seen, 3);
    assert_eq!(items.inserted, 1);
    assert_eq!(items.skipped_no_identity, 2);
    assert_eq!(store.rows("order_line_items").len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing_and_says_so() {
    let config = config();
    let source = ledger_source();
    let store = empty_store();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = MigrationRun::new(&config, &source, &store)
        .unwrap()
        .with_cancellation(cancel)
        .run()
        .await
        .unwrap();

    assert!(outcome.report.cancelled);
    assert_eq!(outcome.report.totals.inserted, 0);
    assert!(store.rows("customers").is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_running() {
    let mut config = config();
    config.tenant_id.clear();
    let source = ledger_source();
    let store = empty_store();

    let result = MigrationRun::new(&config, &source, &store);
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_report_is_persisted_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let source = ledger_source();
    let store = empty_store();

    let outcome = MigrationRun::new(&config, &source, &store).unwrap().run().await.unwrap();
    let path = dir.path().join("reports").join("run.json");
    outcome.report.write_json(&path).unwrap();

    let loaded: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded.run_id, outcome.report.run_id);
    assert_eq!(loaded.tenant_id, TENANT_ID);
    assert_eq!(loaded.table("orders").unwrap().counters.inserted, 3);
    assert_eq!(
        loaded.tables.iter().map(|t| t.table.as_str()).collect::<Vec<_>>(),
        vec!["customers", "orders", "order_line_items", "invoices"]
    );
}
