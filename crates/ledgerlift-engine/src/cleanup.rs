//! Rollback of an erroneous run by cascading, order-aware deletion
//!
//! [`CleanupEngine::plan`] computes the dependency closure of the selected
//! rows: every row in every table that transitively references them. Nothing
//! is deleted at that point. [`CleanupEngine::execute`] then deletes table by
//! table, children before parents. When a table fails, the tables its rows
//! reference are left alone (blocked) while unrelated branches proceed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info, instrument, warn};

use crate::config::MigrationConfig;
use crate::error::{EngineError, Result, TargetError};
use crate::graph::DependencyGraph;
use crate::model::TargetId;
use crate::target::{Filter, Projection, TargetStore};

/// Which rows of the root table to remove
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Ids(Vec<TargetId>),
    /// Rows whose timestamp column is at or after the given instant
    InsertedSince(DateTime<Utc>),
}

/// Rows of one table scheduled for deletion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub table: String,
    pub ids: Vec<TargetId>,
    /// Set when the rows of this table could not be listed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dependency closure of a selection, in deletion order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupPlan {
    pub root_table: String,
    pub steps: Vec<PlanStep>,
}

impl CleanupPlan {
    pub fn total_rows(&self) -> usize {
        self.steps.iter().map(|s| s.ids.len()).sum()
    }

    pub fn step(&self, table: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.table == table)
    }
}

/// Outcome for one table of an executed plan
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Deleted { rows: u64 },
    Empty,
    Failed { error: String },
    /// Not attempted because a table referencing it failed
    Blocked { by: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub tables: Vec<(String, TableOutcome)>,
}

impl CleanupReport {
    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|(t, _)| t == table).map(|(_, o)| o)
    }

    pub fn total_deleted(&self) -> u64 {
        self.tables
            .iter()
            .map(|(_, o)| match o {
                TableOutcome::Deleted { rows } => *rows,
                _ => 0,
            })
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.tables
            .iter()
            .all(|(_, o)| matches!(o, TableOutcome::Deleted { .. } | TableOutcome::Empty))
    }
}

pub struct CleanupEngine<'a> {
    store: &'a dyn TargetStore,
    graph: &'a DependencyGraph,
    tenant_id: String,
    tenant_columns: BTreeMap<String, String>,
    timestamp_column: String,
    chunk_size: usize,
}

impl<'a> CleanupEngine<'a> {
    pub fn new(store: &'a dyn TargetStore, graph: &'a DependencyGraph, config: &MigrationConfig) -> Self {
        Self {
            store,
            graph,
            tenant_id: config.tenant_id.clone(),
            tenant_columns: config
                .tables
                .iter()
                .filter_map(|t| t.tenant_column.clone().map(|c| (t.name.clone(), c)))
                .collect(),
            timestamp_column: config.rollback_timestamp_column.clone(),
            chunk_size: config.batch_size.max(1),
        }
    }

    fn known(&self, table: &str) -> Result<()> {
        if self.graph.contains(table) {
            Ok(())
        } else {
            Err(EngineError::UnknownTable(table.to_string()))
        }
    }

    /// Resolve a selection to ids of `table`, scoped to the tenant when the
    /// table has a tenant column
    #[instrument(skip(self))]
    pub async fn select_targets(&self, table: &str, selection: &Selection) -> Result<Vec<TargetId>> {
        self.known(table)?;
        let tenant = match self.tenant_columns.get(table) {
            Some(column) => Filter::eq(column, &self.tenant_id),
            None => Filter::All,
        };

        let mut ids = Vec::new();
        match selection {
            Selection::Ids(requested) => {
                for chunk in requested.chunks(self.chunk_size) {
                    ids.extend(self.select_ids(table, tenant.clone().and(Filter::ids(chunk))).await?);
                }
            },
            Selection::InsertedSince(at) => {
                let since = Filter::Since {
                    column: self.timestamp_column.clone(),
                    at: *at,
                };
                ids = self.select_ids(table, tenant.and(since)).await?;
            },
        }
        info!(table, selected = ids.len(), "Cleanup targets selected");
        Ok(ids)
    }

    async fn select_ids(&self, table: &str, filter: Filter) -> std::result::Result<Vec<TargetId>, TargetError> {
        Ok(self
            .store
            .select_where(table, &filter, &Projection::fields(&["id"]))
            .await?
            .into_rows()
            .iter()
            .filter_map(TargetId::from_row)
            .collect())
    }

    /// Compute the closure of `ids` in `table` without deleting anything
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn plan(&self, table: &str, ids: &[TargetId]) -> Result<CleanupPlan> {
        self.known(table)?;
        let order = self.graph.insertion_order();
        let start = order.iter().position(|t| t == table).unwrap_or(0);

        let mut closure: BTreeMap<String, Vec<TargetId>> = BTreeMap::new();
        let mut errors: BTreeMap<String, String> = BTreeMap::new();
        let mut reachable: HashSet<&str> = HashSet::new();
        closure.insert(table.to_string(), dedup(ids.to_vec()));
        reachable.insert(table);

        // Topological order guarantees every parent's set is final before
        // its children are looked up.
        for child in order.iter().skip(start + 1) {
            let mut child_ids = Vec::new();
            for edge in self.graph.parents_of(child) {
                if !reachable.contains(edge.parent_table.as_str()) {
                    continue;
                }
                reachable.insert(child.as_str());
                let parent_ids: Vec<String> = closure
                    .get(&edge.parent_table)
                    .map(|ids| ids.iter().map(|id| id.as_str().to_string()).collect())
                    .unwrap_or_default();

                for chunk in parent_ids.chunks(self.chunk_size) {
                    let filter = Filter::In {
                        column: edge.foreign_key_field.clone(),
                        values: chunk.to_vec(),
                    };
                    match self.select_ids(child, filter).await {
                        Ok(found) => child_ids.extend(found),
                        Err(e) => {
                            warn!(table = %child, error = %e, "Could not list dependent rows");
                            errors.insert(child.clone(), e.to_string());
                        },
                    }
                }
            }
            if reachable.contains(child.as_str()) {
                closure.insert(child.clone(), dedup(child_ids));
            }
        }

        let steps = self
            .graph
            .deletion_order()
            .into_iter()
            .filter_map(|t| {
                closure.remove(&t).map(|ids| PlanStep {
                    error: errors.remove(&t),
                    table: t,
                    ids,
                })
            })
            .collect();

        Ok(CleanupPlan {
            root_table: table.to_string(),
            steps,
        })
    }

    /// Delete a plan children-first
    #[instrument(skip(self, plan), fields(root = %plan.root_table))]
    pub async fn execute(&self, plan: &CleanupPlan) -> CleanupReport {
        let in_plan: HashSet<&str> = plan.steps.iter().map(|s| s.table.as_str()).collect();
        let mut blocked: BTreeMap<String, String> = BTreeMap::new();
        let mut report = CleanupReport::default();

        for step in &plan.steps {
            let table = step.table.as_str();
            if let Some(by) = blocked.get(table) {
                warn!(table, blocked_by = %by, "Cleanup blocked");
                report.tables.push((
                    table.to_string(),
                    TableOutcome::Blocked { by: by.clone() },
                ));
                continue;
            }

            let outcome = match &step.error {
                Some(e) => TableOutcome::Failed { error: e.clone() },
                None if step.ids.is_empty() => TableOutcome::Empty,
                None => self.delete_chunked(table, &step.ids).await,
            };

            if let TableOutcome::Failed { error } = &outcome {
                error!(table, error = %error, "Cleanup failed");
                for ancestor in self.ancestors_within(table, &in_plan) {
                    blocked.entry(ancestor).or_insert_with(|| table.to_string());
                }
            }
            report.tables.push((table.to_string(), outcome));
        }

        info!(deleted = report.total_deleted(), success = report.is_success(), "Cleanup finished");
        report
    }

    /// Plan and execute in one call
    pub async fn cascade_delete(&self, table: &str, ids: &[TargetId]) -> Result<CleanupReport> {
        let plan = self.plan(table, ids).await?;
        Ok(self.execute(&plan).await)
    }

    async fn delete_chunked(&self, table: &str, ids: &[TargetId]) -> TableOutcome {
        let mut rows = 0;
        for chunk in ids.chunks(self.chunk_size) {
            match self.store.delete_where(table, chunk).await {
                Ok(n) => rows += n,
                Err(e) => {
                    return TableOutcome::Failed {
                        error: e.to_string(),
                    }
                },
            }
        }
        info!(table, rows, "Rows deleted");
        TableOutcome::Deleted { rows }
    }

    /// Tables that `table` references, transitively, restricted to the plan
    fn ancestors_within(&self, table: &str, in_plan: &HashSet<&str>) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut stack = vec![table.to_string()];
        while let Some(current) = stack.pop() {
            for edge in self.graph.parents_of(&current) {
                let parent = &edge.parent_table;
                if in_plan.contains(parent.as_str()) && !found.contains(parent) {
                    found.push(parent.clone());
                    stack.push(parent.clone());
                }
            }
        }
        found
    }
}

fn dedup(ids: Vec<TargetId>) -> Vec<TargetId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_tables;
    use crate::target::MemoryStore;
    use serde_json::{json, Value};

    fn config() -> MigrationConfig {
        MigrationConfig {
            tenant_id: "t1".to_string(),
            batch_size: 2,
            ..MigrationConfig::default()
        }
    }

    fn row(value: Value) -> crate::model::Row {
        value.as_object().cloned().unwrap()
    }

    /// One customer with two orders, each with a line item, and an invoice
    /// on the first order; plus an unrelated customer with one order
    fn seeded() -> (MemoryStore, DependencyGraph, TargetId, TargetId) {
        let graph = config().validate().unwrap();
        let store = MemoryStore::new(graph.clone());
        let c = store
            .seed(
                "customers",
                vec![
                    row(json!({"linked_company": "t1", "display_name": "Acme"})),
                    row(json!({"linked_company": "t1", "display_name": "Other"})),
                ],
            )
            .unwrap();
        let o = store
            .seed(
                "orders",
                vec![
                    row(json!({"company_id": "t1", "customer_id": c[0].as_str()})),
                    row(json!({"company_id": "t1", "customer_id": c[0].as_str()})),
                    row(json!({"company_id": "t1", "customer_id": c[1].as_str()})),
                ],
            )
            .unwrap();
        store
            .seed(
                "order_line_items",
                vec![
                    row(json!({"order_id": o[0].as_str()})),
                    row(json!({"order_id": o[1].as_str()})),
                    row(json!({"order_id": o[2].as_str()})),
                ],
            )
            .unwrap();
        store
            .seed(
                "invoices",
                vec![row(json!({"company_id": "t1", "customer_id": c[0].as_str(), "order_id": o[0].as_str()}))],
            )
            .unwrap();
        (store, graph, c[0].clone(), c[1].clone())
    }

    #[tokio::test]
    async fn test_plan_covers_the_closure_in_deletion_order() {
        let (store, graph, acme, _) = seeded();
        let config = config();
        let engine = CleanupEngine::new(&store, &graph, &config);

        let plan = engine.plan("customers", &[acme]).await.unwrap();
        let tables: Vec<_> = plan.steps.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(tables, vec!["shipments", "invoices", "order_line_items", "orders", "customers"]);
        assert_eq!(plan.step("orders").unwrap().ids.len(), 2);
        assert_eq!(plan.step("order_line_items").unwrap().ids.len(), 2);
        assert_eq!(plan.step("invoices").unwrap().ids.len(), 1);
        assert_eq!(plan.total_rows(), 6);
        assert_eq!(store.rows("orders").len(), 3, "planning deletes nothing");
    }

    #[tokio::test]
    async fn test_cascade_leaves_no_children_and_spares_unrelated_rows() {
        let (store, graph, acme, other) = seeded();
        let config = config();
        let engine = CleanupEngine::new(&store, &graph, &config);

        let report = engine.cascade_delete("customers", &[acme.clone()]).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.total_deleted(), 6);

        let customers = store.rows("customers");
        assert_eq!(customers.len(), 1);
        assert_eq!(TargetId::from_row(&customers[0]), Some(other));
        assert!(store
            .rows("orders")
            .iter()
            .all(|o| o.get("customer_id") != Some(&json!(acme.as_str()))));
        assert_eq!(store.rows("order_line_items").len(), 1);
        assert!(store.rows("invoices").is_empty());

        let again = engine.cascade_delete("customers", &[acme]).await.unwrap();
        assert!(again.is_success());
        assert_eq!(again.total_deleted(), 0);
    }

    #[tokio::test]
    async fn test_failure_blocks_ancestors_only() {
        let (store, graph, acme, _) = seeded();
        let config = config();
        let engine = CleanupEngine::new(&store, &graph, &config);
        store.push_delete_failure("order_line_items", TargetError::Transient("reset".into()));

        let report = engine.cascade_delete("customers", &[acme]).await.unwrap();
        assert!(!report.is_success());
        assert!(matches!(report.outcome("order_line_items"), Some(TableOutcome::Failed { .. })));
        assert_eq!(
            report.outcome("orders"),
            Some(&TableOutcome::Blocked {
                by: "order_line_items".to_string()
            })
        );
        assert!(matches!(report.outcome("customers"), Some(TableOutcome::Blocked { .. })));
        assert!(matches!(report.outcome("invoices"), Some(TableOutcome::Deleted { rows: 1 })));
        assert_eq!(store.rows("orders").len(), 3);
    }

    #[tokio::test]
    async fn test_select_failure_while_planning_fails_table_and_blocks_parents() {
        let (store, graph, acme, _) = seeded();
        let config = config();
        let engine = CleanupEngine::new(&store, &graph, &config);
        store.push_select_failure("orders", TargetError::Transient("statement timeout".into()));

        let plan = engine.plan("customers", &[acme]).await.unwrap();
        let orders = plan.step("orders").unwrap();
        assert!(orders.ids.is_empty());
        assert!(orders.error.as_deref().unwrap().contains("statement timeout"));
        assert_eq!(plan.step("invoices").unwrap().ids.len(), 1);

        let report = engine.execute(&plan).await;
        assert!(!report.is_success());
        assert!(matches!(report.outcome("orders"), Some(TableOutcome::Failed { .. })));
        assert_eq!(
            report.outcome("customers"),
            Some(&TableOutcome::Blocked {
                by: "orders".to_string()
            })
        );
        // The invoice hangs off the customer directly and is still removed
        assert_eq!(report.outcome("invoices"), Some(&TableOutcome::Deleted { rows: 1 }));
        assert!(store.rows("invoices").is_empty());
        assert_eq!(store.rows("orders").len(), 3);
        assert_eq!(store.rows("customers").len(), 2);
    }

    #[tokio::test]
    async fn test_selection_is_tenant_scoped() {
        let graph = config().validate().unwrap();
        let store = MemoryStore::new(graph.clone());
        let ids = store
            .seed(
                "customers",
                vec![
                    row(json!({"linked_company": "t1", "migrated_at": "2024-05-01T10:00:00.000Z"})),
                    row(json!({"linked_company": "t2", "migrated_at": "2024-05-01T11:00:00.000Z"})),
                    row(json!({"linked_company": "t1", "migrated_at": "2024-04-01T00:00:00.000Z"})),
                ],
            )
            .unwrap();
        let config = config();
        let engine = CleanupEngine::new(&store, &graph, &config);

        let by_ids = engine
            .select_targets("customers", &Selection::Ids(ids.clone()))
            .await
            .unwrap();
        assert_eq!(by_ids, vec![ids[0].clone(), ids[2].clone()]);

        let since = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let recent = engine
            .select_targets("customers", &Selection::InsertedSince(since))
            .await
            .unwrap();
        assert_eq!(recent, vec![ids[0].clone()]);

        assert!(matches!(
            engine.select_targets("widgets", &Selection::Ids(vec![])).await,
            Err(EngineError::UnknownTable(_))
        ));
    }
}
