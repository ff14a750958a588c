//! In-memory target store
//!
//! Behaves like the relational target for everything the engine relies on:
//! all-or-nothing batch inserts, generated `id`, defaulted `created_at` and
//! insert-time `migrated_at` columns, and enforced foreign keys on insert (missing parent) and delete
//! (restrict while children still reference the row). Failures can be scripted per
//! table to exercise retry and partial-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{Filter, Projection, Selected, TargetStore};
use crate::error::TargetError;
use crate::graph::DependencyGraph;
use crate::model::{scalar_to_string, Row, TargetId};
use crate::normalize::normalize_timestamp;

/// Insert-time column stamped on every stored row
pub const MIGRATED_AT: &str = "migrated_at";

/// Scripted outcome for the next insert into a table
#[derive(Debug, Clone)]
enum InsertFault {
    Fail(TargetError),
    /// Store only the first `n` rows and return them
    Partial(usize),
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Vec<Row>>,
    insert_faults: HashMap<String, VecDeque<InsertFault>>,
    delete_faults: HashMap<String, VecDeque<TargetError>>,
    select_faults: HashMap<String, VecDeque<TargetError>>,
    insert_attempts: HashMap<String, usize>,
}

/// Thread-safe in-memory relational store
#[derive(Debug)]
pub struct MemoryStore {
    graph: DependencyGraph,
    state: Mutex<State>,
}

impl MemoryStore {
    /// Empty store with one table per graph node and foreign keys per edge
    pub fn new(graph: DependencyGraph) -> Self {
        let tables = graph
            .insertion_order()
            .iter()
            .map(|t| (t.clone(), Vec::new()))
            .collect();
        Self {
            graph,
            state: Mutex::new(State {
                tables,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, TargetError> {
        self.state
            .lock()
            .map_err(|_| TargetError::Other("memory store lock poisoned".to_string()))
    }

    /// Insert rows directly, bypassing scripted faults. Rows without an `id`
    /// get one assigned. Returns the assigned ids.
    pub fn seed(&self, table: &str, rows: Vec<Row>) -> Result<Vec<TargetId>, TargetError> {
        let mut state = self.lock()?;
        let stored = self.insert_rows(&mut state, table, &rows)?;
        Ok(stored.iter().filter_map(TargetId::from_row).collect())
    }

    /// Snapshot of a table's rows in insertion order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .ok()
            .and_then(|state| state.tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Number of `insert_batch` calls made for a table, failed ones included
    pub fn insert_attempts(&self, table: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.insert_attempts.get(table).copied())
            .unwrap_or(0)
    }

    /// Make the next insert into `table` fail with `error`
    pub fn push_insert_failure(&self, table: &str, error: TargetError) {
        if let Ok(mut state) = self.lock() {
            state
                .insert_faults
                .entry(table.to_string())
                .or_default()
                .push_back(InsertFault::Fail(error));
        }
    }

    /// Make the next insert into `table` store and return only `keep` rows
    pub fn push_partial_insert(&self, table: &str, keep: usize) {
        if let Ok(mut state) = self.lock() {
            state
                .insert_faults
                .entry(table.to_string())
                .or_default()
                .push_back(InsertFault::Partial(keep));
        }
    }

    /// Make the next delete from `table` fail with `error`
    pub fn push_delete_failure(&self, table: &str, error: TargetError) {
        if let Ok(mut state) = self.lock() {
            state
                .delete_faults
                .entry(table.to_string())
                .or_default()
                .push_back(error);
        }
    }

    /// Make the next select from `table` fail with `error`
    pub fn push_select_failure(&self, table: &str, error: TargetError) {
        if let Ok(mut state) = self.lock() {
            state
                .select_faults
                .entry(table.to_string())
                .or_default()
                .push_back(error);
        }
    }

    /// Validate and append rows as one unit; nothing is stored on error
    fn insert_rows(&self, state: &mut State, table: &str, rows: &[Row]) -> Result<Vec<Row>, TargetError> {
        if !state.tables.contains_key(table) {
            return Err(TargetError::Other(format!("relation \"{table}\" does not exist")));
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            if row.get("id").map_or(true, Value::is_null) {
                row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            for column in ["created_at", MIGRATED_AT] {
                if !row.contains_key(column) {
                    row.insert(column.to_string(), Value::String(now.clone()));
                }
            }

            for edge in self.graph.parents_of(table) {
                let reference = row
                    .get(&edge.foreign_key_field)
                    .filter(|v| !v.is_null())
                    .and_then(scalar_to_string);
                match reference {
                    None if edge.required => {
                        return Err(TargetError::constraint(
                            table,
                            format!("null value in column \"{}\" violates not-null constraint", edge.foreign_key_field),
                        ));
                    },
                    None => {},
                    Some(parent_id) => {
                        let exists = state
                            .tables
                            .get(&edge.parent_table)
                            .is_some_and(|parents| parents.iter().any(|p| id_of(p).as_deref() == Some(parent_id.as_str())));
                        if !exists {
                            return Err(TargetError::constraint(
                                table,
                                format!(
                                    "insert violates foreign key \"{}\": key ({})=({}) is not present in \"{}\"",
                                    edge.foreign_key_field, edge.foreign_key_field, parent_id, edge.parent_table
                                ),
                            ));
                        }
                    },
                }
            }
            prepared.push(row);
        }

        if let Some(stored) = state.tables.get_mut(table) {
            stored.extend(prepared.iter().cloned());
        }
        Ok(prepared)
    }
}

fn id_of(row: &Row) -> Option<String> {
    row.get("id").and_then(scalar_to_string)
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Eq { column, value } => row.get(column).and_then(scalar_to_string).as_deref() == Some(value.as_str()),
        Filter::In { column, values } => row
            .get(column)
            .and_then(scalar_to_string)
            .is_some_and(|v| values.contains(&v)),
        Filter::Since { column, at } => row
            .get(column)
            .and_then(normalize_timestamp)
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .is_some_and(|ts| ts.with_timezone(&Utc) >= *at),
        Filter::And(filters) => filters.iter().all(|f| matches(row, f)),
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<Vec<Row>, TargetError> {
        let mut state = self.lock()?;
        *state.insert_attempts.entry(table.to_string()).or_insert(0) += 1;

        let fault = state.insert_faults.get_mut(table).and_then(VecDeque::pop_front);
        match fault {
            Some(InsertFault::Fail(error)) => Err(error),
            Some(InsertFault::Partial(keep)) => {
                let keep = keep.min(rows.len());
                self.insert_rows(&mut state, table, &rows[..keep])
            },
            None => self.insert_rows(&mut state, table, rows),
        }
    }

    async fn delete_where(&self, table: &str, ids: &[TargetId]) -> Result<u64, TargetError> {
        let mut state = self.lock()?;
        if let Some(error) = state.delete_faults.get_mut(table).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if !state.tables.contains_key(table) {
            return Err(TargetError::Other(format!("relation \"{table}\" does not exist")));
        }

        let doomed: Vec<&str> = ids.iter().map(TargetId::as_str).collect();
        for edge in self.graph.children_of(table) {
            let referenced = state.tables.get(&edge.child_table).is_some_and(|children| {
                children.iter().any(|child| {
                    child
                        .get(&edge.foreign_key_field)
                        .and_then(scalar_to_string)
                        .is_some_and(|parent| doomed.contains(&parent.as_str()))
                })
            });
            if referenced {
                return Err(TargetError::constraint(
                    table,
                    format!(
                        "delete violates foreign key \"{}\" on table \"{}\"",
                        edge.foreign_key_field, edge.child_table
                    ),
                ));
            }
        }

        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| id_of(row).map_or(true, |id| !doomed.contains(&id.as_str())));
        Ok((before - rows.len()) as u64)
    }

    async fn select_where(
        &self,
        table: &str,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Selected, TargetError> {
        let mut state = self.lock()?;
        if let Some(error) = state.select_faults.get_mut(table).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| TargetError::Other(format!("relation \"{table}\" does not exist")))?;
        let matching = rows.iter().filter(|row| matches(row, filter));

        Ok(match projection {
            Projection::CountOnly => Selected::Count(matching.count() as u64),
            Projection::Fields(columns) => Selected::Rows(
                matching
                    .map(|row| {
                        columns
                            .iter()
                            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                            .collect()
                    })
                    .collect(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyEdge;
    use serde_json::json;

    fn store() -> MemoryStore {
        let graph = DependencyGraph::new(
            vec!["customers".to_string(), "orders".to_string()],
            vec![DependencyEdge::new("orders", "customers", "customer_id", true)],
        )
        .unwrap();
        MemoryStore::new(graph)
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_enforces_foreign_keys() {
        let store = store();
        let ids = store
            .seed("customers", vec![row(json!({"display_name": "Acme"}))])
            .unwrap();
        assert_eq!(ids.len(), 1);

        let inserted = store
            .insert_batch("orders", &[row(json!({"customer_id": ids[0].as_str()}))])
            .await
            .unwrap();
        assert!(TargetId::from_row(&inserted[0]).is_some());

        let err = store
            .insert_batch(
                "orders",
                &[
                    row(json!({"customer_id": ids[0].as_str()})),
                    row(json!({"customer_id": null})),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Constraint { .. }));
        assert_eq!(store.rows("orders").len(), 1, "failed batch stores nothing");

        let err = store
            .insert_batch("orders", &[row(json!({"customer_id": "missing"}))])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_delete_restricts_while_referenced() {
        let store = store();
        let customers = store.seed("customers", vec![row(json!({}))]).unwrap();
        let orders = store
            .seed("orders", vec![row(json!({"customer_id": customers[0].as_str()}))])
            .unwrap();

        assert!(store.delete_where("customers", &customers).await.is_err());
        assert_eq!(store.delete_where("orders", &orders).await.unwrap(), 1);
        assert_eq!(store.delete_where("customers", &customers).await.unwrap(), 1);
        assert_eq!(store.delete_where("customers", &customers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scripted_faults_are_consumed_in_order() {
        let store = store();
        store.push_insert_failure("customers", TargetError::RateLimited("429".into()));
        store.push_partial_insert("customers", 1);

        let rows = vec![row(json!({"n": 1})), row(json!({"n": 2}))];
        assert!(store.insert_batch("customers", &rows).await.is_err());
        assert_eq!(store.insert_batch("customers", &rows).await.unwrap().len(), 1);
        assert_eq!(store.insert_batch("customers", &rows).await.unwrap().len(), 2);
        assert_eq!(store.insert_attempts("customers"), 3);
        assert_eq!(store.rows("customers").len(), 3);
    }

    #[tokio::test]
    async fn test_select_filters_and_projects() {
        let store = store();
        store
            .seed(
                "customers",
                vec![
                    row(json!({"linked_company": "t1", "display_name": "A", "created_at": "2024-01-01T00:00:00.000Z"})),
                    row(json!({"linked_company": "t2", "display_name": "B", "created_at": "2024-03-01T00:00:00.000Z"})),
                    row(json!({"linked_company": "t1", "display_name": "C", "created_at": "2024-06-01T00:00:00.000Z"})),
                ],
            )
            .unwrap();

        let since = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let filter = Filter::eq("linked_company", "t1").and(Filter::Since {
            column: "created_at".to_string(),
            at: since,
        });
        let rows = store
            .select_where("customers", &filter, &Projection::fields(&["display_name"]))
            .await
            .unwrap()
            .into_rows();
        assert_eq!(rows, vec![row(json!({"display_name": "C"}))]);

        let count = store
            .select_where("customers", &Filter::eq("linked_company", "t1"), &Projection::CountOnly)
            .await
            .unwrap();
        assert_eq!(count, Selected::Count(2));
    }
}
