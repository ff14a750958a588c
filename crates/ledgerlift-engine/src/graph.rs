//! Table dependency graph
//!
//! Built once from the declared foreign keys. Insertion order puts parents
//! before children; deletion order is its exact reverse.

use std::collections::{HashMap, HashSet};

use crate::config::TableSpec;
use crate::error::{EngineError, Result};

/// Static declaration that `child_table.foreign_key_field` references
/// `parent_table.id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub child_table: String,
    pub parent_table: String,
    pub foreign_key_field: String,
    pub required: bool,
}

impl DependencyEdge {
    pub fn new(child: &str, parent: &str, field: &str, required: bool) -> Self {
        Self {
            child_table: child.to_string(),
            parent_table: parent.to_string(),
            foreign_key_field: field.to_string(),
            required,
        }
    }
}

/// Acyclic set of tables and edges with a precomputed topological order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tables: Vec<String>,
    edges: Vec<DependencyEdge>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate and order the graph.
    ///
    /// Ties are broken by declaration order, so the same declaration always
    /// yields the same insertion order.
    pub fn new(tables: Vec<String>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let known: HashSet<&str> = tables.iter().map(String::as_str).collect();
        for edge in &edges {
            for table in [&edge.child_table, &edge.parent_table] {
                if !known.contains(table.as_str()) {
                    return Err(EngineError::UnknownTable(table.clone()));
                }
            }
            if edge.child_table == edge.parent_table {
                return Err(EngineError::DependencyCycle(vec![
                    edge.child_table.clone(),
                    edge.parent_table.clone(),
                ]));
            }
        }

        let mut pending: HashMap<&str, HashSet<&str>> = tables
            .iter()
            .map(|t| (t.as_str(), HashSet::new()))
            .collect();
        for edge in &edges {
            if let Some(parents) = pending.get_mut(edge.child_table.as_str()) {
                parents.insert(edge.parent_table.as_str());
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(tables.len());
        while order.len() < tables.len() {
            let next = tables.iter().find(|t| {
                !order.contains(t) && pending.get(t.as_str()).is_some_and(HashSet::is_empty)
            });
            let Some(next) = next else {
                return Err(EngineError::DependencyCycle(find_cycle(&tables, &edges, &order)));
            };
            for parents in pending.values_mut() {
                parents.remove(next.as_str());
            }
            order.push(next.clone());
        }

        Ok(Self {
            tables,
            edges,
            order,
        })
    }

    /// Graph of the given table specs, one edge per declared foreign key
    pub fn from_specs(specs: &[TableSpec]) -> Result<Self> {
        let tables = specs.iter().map(|s| s.name.clone()).collect();
        let edges = specs
            .iter()
            .flat_map(|spec| {
                spec.foreign_keys
                    .iter()
                    .map(|fk| DependencyEdge::new(&spec.name, &fk.parent, &fk.column, fk.required))
            })
            .collect();
        Self::new(tables, edges)
    }

    /// Parents before children
    pub fn insertion_order(&self) -> &[String] {
        &self.order
    }

    /// Children before parents
    pub fn deletion_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges pointing at `table` (tables that reference it)
    pub fn children_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a DependencyEdge> + 'a {
        self.edges.iter().filter(move |e| e.parent_table == table)
    }

    /// Edges leaving `table` (tables it references)
    pub fn parents_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a DependencyEdge> + 'a {
        self.edges.iter().filter(move |e| e.child_table == table)
    }
}

/// Walk parent links among the unordered tables until one repeats
fn find_cycle(tables: &[String], edges: &[DependencyEdge], ordered: &[String]) -> Vec<String> {
    let remaining: Vec<&String> = tables.iter().filter(|t| !ordered.contains(t)).collect();
    let Some(start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<String> = vec![(*start).clone()];
    loop {
        let current = path.last().cloned().unwrap_or_default();
        let next = edges
            .iter()
            .find(|e| e.child_table == current && remaining.contains(&&e.parent_table))
            .map(|e| e.parent_table.clone());
        let Some(next) = next else {
            return path;
        };
        if let Some(pos) = path.iter().position(|t| *t == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
    }
}
