//! Identity resolution across the source and target key spaces
//!
//! Two indexes back the resolver:
//!
//! - [`IdentityLinks`]: `(table, source_id) -> target_id`, append-only and
//!   never overwritten, primed from rows a previous run already wrote
//! - [`SecondaryIndex`]: `(table, normalized alternate key) -> target ids` in
//!   build order, used when the source id is unknown to the target
//!
//! Strategies run in configured order and the first match wins.

use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::config::{AmbiguityPolicy, ForeignKeyRule, MatchStrategy, TableSpec};
use crate::error::TargetError;
use crate::model::{scalar_to_string, SourceRecord, TargetId};
use crate::target::{Filter, Projection, TargetStore};

/// Result of adding a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Inserted,
    /// A link already existed and was kept
    Existing(TargetId),
}

/// Append-only `(table, source_id) -> target_id` map
#[derive(Debug, Default, Clone)]
pub struct IdentityLinks {
    links: HashMap<(String, String), TargetId>,
}

impl IdentityLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a link unless one exists already; the first link wins
    pub fn link(&mut self, table: &str, source_id: &str, target_id: TargetId) -> LinkOutcome {
        let key = (table.to_string(), source_id.to_string());
        match self.links.get(&key) {
            Some(existing) => LinkOutcome::Existing(existing.clone()),
            None => {
                self.links.insert(key, target_id);
                LinkOutcome::Inserted
            },
        }
    }

    pub fn get(&self, table: &str, source_id: &str) -> Option<&TargetId> {
        self.links.get(&(table.to_string(), source_id.to_string()))
    }

    pub fn len_for(&self, table: &str) -> usize {
        self.links.keys().filter(|(t, _)| t == table).count()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Lowercase, trim and collapse inner whitespace
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Outcome of a secondary-key lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryMatch<'a> {
    None,
    Unique(&'a TargetId),
    /// More than one row shares the key; `first` is the earliest in build
    /// order
    Ambiguous { first: &'a TargetId, candidates: usize },
}

/// Alternate-key index built from target rows
#[derive(Debug, Default, Clone)]
pub struct SecondaryIndex {
    entries: HashMap<(String, String), Vec<TargetId>>,
}

impl SecondaryIndex {
    pub fn insert(&mut self, table: &str, raw_key: &str, target_id: TargetId) {
        let key = normalize_key(raw_key);
        if key.is_empty() {
            return;
        }
        let ids = self.entries.entry((table.to_string(), key)).or_default();
        if !ids.contains(&target_id) {
            ids.push(target_id);
        }
    }

    pub fn lookup(&self, table: &str, raw_key: &str) -> SecondaryMatch<'_> {
        match self.entries.get(&(table.to_string(), normalize_key(raw_key))) {
            Some(ids) if ids.len() == 1 => SecondaryMatch::Unique(&ids[0]),
            Some(ids) => match ids.first() {
                Some(first) => SecondaryMatch::Ambiguous {
                    first,
                    candidates: ids.len(),
                },
                None => SecondaryMatch::None,
            },
            None => SecondaryMatch::None,
        }
    }
}

/// How a reference was (or was not) resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Direct(TargetId),
    Secondary { target_id: TargetId, ambiguous: bool },
    Unresolved { ambiguous: bool },
}

impl Resolution {
    pub fn target_id(&self) -> Option<&TargetId> {
        match self {
            Resolution::Direct(id) | Resolution::Secondary { target_id: id, .. } => Some(id),
            Resolution::Unresolved { .. } => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Resolution::Secondary { ambiguous: true, .. } | Resolution::Unresolved { ambiguous: true }
        )
    }
}

/// Multi-strategy resolver; owned by one run, mutated only by it
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    links: IdentityLinks,
    secondary: SecondaryIndex,
    strategies: Vec<MatchStrategy>,
    ambiguity: AmbiguityPolicy,
}

impl IdentityResolver {
    pub fn new(strategies: Vec<MatchStrategy>, ambiguity: AmbiguityPolicy) -> Self {
        Self {
            links: IdentityLinks::new(),
            secondary: SecondaryIndex::default(),
            strategies,
            ambiguity,
        }
    }

    pub fn links(&self) -> &IdentityLinks {
        &self.links
    }

    pub fn into_links(self) -> IdentityLinks {
        self.links
    }

    /// Load the rows of `spec.name` already in the target (scoped to
    /// `tenant` when the table has a tenant column) into both indexes.
    /// Returns the number of rows read.
    #[instrument(skip(self, store, spec), fields(table = %spec.name))]
    pub async fn prime(
        &mut self,
        store: &dyn TargetStore,
        spec: &TableSpec,
        tenant: &str,
    ) -> Result<usize, TargetError> {
        let mut columns = vec!["id", spec.source_key_column.as_str()];
        if let Some(secondary) = &spec.secondary_key {
            columns.push(secondary.column.as_str());
        }
        let filter = match &spec.tenant_column {
            Some(column) => Filter::eq(column, tenant),
            None => Filter::All,
        };

        let rows = store
            .select_where(&spec.name, &filter, &Projection::fields(&columns))
            .await?
            .into_rows();

        for row in &rows {
            let Some(target_id) = TargetId::from_row(row) else {
                continue;
            };
            if let Some(source_id) = row.get(&spec.source_key_column).and_then(scalar_to_string) {
                self.links.link(&spec.name, &source_id, target_id.clone());
            }
            if let Some(secondary) = &spec.secondary_key {
                if let Some(key) = row.get(&secondary.column).and_then(scalar_to_string) {
                    self.secondary.insert(&spec.name, &key, target_id);
                }
            }
        }

        debug!(rows = rows.len(), links = self.links.len_for(&spec.name), "Identity index primed");
        Ok(rows.len())
    }

    /// Resolve a reference to `table` given the referenced record's source id
    /// and/or its alternate key. A secondary match is memoized as a link for
    /// the source id, so resolving again returns the same target id.
    pub fn resolve(&mut self, table: &str, source_id: Option<&str>, secondary_key: Option<&str>) -> Resolution {
        let mut ambiguous = false;
        for strategy in &self.strategies {
            match strategy {
                MatchStrategy::Direct => {
                    if let Some(id) = source_id.and_then(|s| self.links.get(table, s)) {
                        return Resolution::Direct(id.clone());
                    }
                },
                MatchStrategy::Secondary => {
                    let Some(key) = secondary_key else { continue };
                    let found = match self.secondary.lookup(table, key) {
                        SecondaryMatch::None => None,
                        SecondaryMatch::Unique(id) => Some(id.clone()),
                        SecondaryMatch::Ambiguous { first, candidates } => {
                            ambiguous = true;
                            debug!(table, key, candidates, "Ambiguous secondary match");
                            match self.ambiguity {
                                AmbiguityPolicy::FirstWins => Some(first.clone()),
                                AmbiguityPolicy::Reject => None,
                            }
                        },
                    };
                    if let Some(target_id) = found {
                        if let Some(source_id) = source_id {
                            self.links.link(table, source_id, target_id.clone());
                        }
                        return Resolution::Secondary { target_id, ambiguous };
                    }
                },
            }
        }
        Resolution::Unresolved { ambiguous }
    }

    /// Resolve one foreign key of `record`
    pub fn resolve_foreign_key(&mut self, record: &SourceRecord, fk: &ForeignKeyRule) -> Resolution {
        let source_id = record.first_string(&fk.from).map(|s| s.trim().to_string());
        let secondary_key = record.first_string(&fk.secondary_from);
        self.resolve(&fk.parent, source_id.as_deref(), secondary_key.as_deref())
    }

    /// Link of a record's own identity, if it was migrated before
    pub fn existing(&self, table: &str, source_id: &str) -> Option<&TargetId> {
        self.links.get(table, source_id)
    }

    /// Register a freshly inserted row in both indexes
    pub fn record_inserted(
        &mut self,
        table: &str,
        source_id: &str,
        target_id: TargetId,
        secondary_key: Option<&str>,
    ) -> LinkOutcome {
        if let Some(key) = secondary_key {
            self.secondary.insert(table, key, target_id.clone());
        }
        self.links.link(table, source_id, target_id)
    }
}
