//! One migration run, end to end
//!
//! For every table in insertion order: extract its source records, normalize
//! them, resolve their foreign keys, and hand the survivors to the batch
//! writer. Identity indexes are primed from the target first so a re-run
//! never inserts a record twice. The reporter observes every step.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{MigrationConfig, TableSpec};
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::identity::{IdentityLinks, IdentityResolver};
use crate::model::{CanonicalEntity, CanonicalValue, SourceRecord, PARENT_FIELD};
use crate::normalize::{source_id_of, Normalizer};
use crate::report::{MigrationEvent, Reporter, RunReport};
use crate::source::{Extraction, Extractor, SourceStore};
use crate::target::{Filter, Projection, TargetStore};
use crate::writer::BatchWriter;

/// Result of a finished (or cancelled) run
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub report: RunReport,
    pub links: IdentityLinks,
}

pub struct MigrationRun<'a> {
    config: &'a MigrationConfig,
    graph: DependencyGraph,
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    cancel: CancellationToken,
}

impl<'a> MigrationRun<'a> {
    /// Validate the configuration and prepare a run
    pub fn new(config: &'a MigrationConfig, source: &'a dyn SourceStore, target: &'a dyn TargetStore) -> Result<Self> {
        let graph = config.validate()?;
        Ok(Self {
            config,
            graph,
            source,
            target,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[instrument(skip(self), fields(tenant = %self.config.tenant_id))]
    pub async fn run(&self) -> Result<MigrationOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, tables = self.graph.insertion_order().len(), "Migration run started");

        let mut resolver = IdentityResolver::new(self.config.strategies.clone(), self.config.ambiguity);
        for table in self.graph.insertion_order() {
            if let Some(spec) = self.config.table(table) {
                resolver.prime(self.target, spec, &self.config.tenant_id).await?;
            }
        }

        let mut reporter = Reporter::new();
        let mut extractions: HashMap<String, Extraction> = HashMap::new();
        let mut extraction_order: Vec<String> = Vec::new();
        let extractor = Extractor::new(self.source, self.config.page_size, self.config.retry)
            .with_checkpoint_dir(self.config.checkpoint_dir.as_deref())
            .with_cancellation(self.cancel.clone());
        let writer = BatchWriter::new(self.target, self.config.batch_size, self.config.retry)
            .with_cancellation(self.cancel.clone());
        let normalizer = Normalizer::new(&self.config.enums);

        for table in self.graph.insertion_order() {
            let Some(spec) = self.config.table(table) else { continue };
            let Some(binding) = &spec.source else {
                debug!(table = %table, "No source binding, table not migrated");
                continue;
            };
            if self.cancel.is_cancelled() {
                warn!(table = %table, "Run cancelled, remaining tables skipped");
                break;
            }
            reporter.touch(table);

            if !extractions.contains_key(&binding.resource) {
                let child_types = self.config.child_types_of(&binding.resource);
                let extraction = extractor.extract(&binding.resource, &child_types).await?;
                extraction_order.push(binding.resource.clone());
                extractions.insert(binding.resource.clone(), extraction);
            }
            let (records, malformed) = match extractions.get(&binding.resource) {
                Some(extraction) => match &binding.nested_under {
                    None => (extraction.records.clone(), 0),
                    Some(child_type) => flatten_children(&extraction.records, child_type),
                },
                None => (Vec::new(), 0),
            };
            if malformed > 0 {
                warn!(table = %table, malformed, "Nested items that are not objects skipped");
            }
            for _ in 0..malformed {
                reporter.record(table, MigrationEvent::Seen);
                reporter.record(table, MigrationEvent::SkippedNoIdentity);
            }

            let entities = self.prepare(&records, spec, &normalizer, &mut resolver, &mut reporter);
            writer.write_all(entities, spec, &mut resolver, &mut reporter).await;

            let c = reporter.counters(table);
            info!(
                table = %table,
                seen = c.seen,
                inserted = c.inserted,
                already_migrated = c.already_migrated,
                skipped_no_identity = c.skipped_no_identity,
                skipped_no_required_fk = c.skipped_no_required_fk,
                insert_errors = c.insert_errors,
                "Table migrated"
            );
        }

        let target_row_counts = self.count_rows().await;
        let report = RunReport::build(
            run_id,
            &self.config.tenant_id,
            started_at,
            &reporter,
            target_row_counts,
            extraction_order
                .iter()
                .filter_map(|r| extractions.get(r))
                .map(Extraction::summary)
                .collect(),
            self.config.skip_rate_threshold,
            self.cancel.is_cancelled(),
        );
        for table in &report.flagged_tables {
            warn!(table = %table, threshold = self.config.skip_rate_threshold, "Skip rate above threshold");
        }
        info!(%run_id, inserted = report.totals.inserted, failed = report.totals.insert_errors, "Migration run finished");

        Ok(MigrationOutcome {
            report,
            links: resolver.into_links(),
        })
    }

    /// Normalize and resolve the records of one table; everything excluded
    /// is counted under its reason
    fn prepare(
        &self,
        records: &[SourceRecord],
        spec: &TableSpec,
        normalizer: &Normalizer<'_>,
        resolver: &mut IdentityResolver,
        reporter: &mut Reporter,
    ) -> Vec<CanonicalEntity> {
        let table = spec.name.as_str();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut entities = Vec::with_capacity(records.len());

        for record in records {
            reporter.record(table, MigrationEvent::Seen);

            let Some(source_id) = source_id_of(record, spec) else {
                reporter.record(table, MigrationEvent::SkippedNoIdentity);
                continue;
            };
            if resolver.existing(table, &source_id).is_some() {
                reporter.record(table, MigrationEvent::AlreadyMigrated);
                continue;
            }
            if !seen_ids.insert(source_id.clone()) {
                reporter.record(table, MigrationEvent::Duplicate);
                continue;
            }

            let mut entity = normalizer.normalize(record, spec, &source_id);
            if let Some(column) = &spec.tenant_column {
                entity.set(column, CanonicalValue::Text(self.config.tenant_id.clone()));
            }

            let mut missing_required = false;
            for fk in &spec.foreign_keys {
                let resolution = resolver.resolve_foreign_key(record, fk);
                if resolution.is_ambiguous() {
                    reporter.record(table, MigrationEvent::AmbiguousMatch);
                }
                match resolution.target_id() {
                    Some(target_id) => {
                        entity.set(&fk.column, CanonicalValue::Text(target_id.as_str().to_string()));
                    },
                    None if fk.required => {
                        debug!(table, source_id = %source_id, column = %fk.column, "Required reference unresolved");
                        missing_required = true;
                    },
                    None => {
                        entity.set(&fk.column, CanonicalValue::Null);
                        reporter.record(table, MigrationEvent::UnresolvedOptionalFk);
                    },
                }
            }
            if missing_required {
                reporter.record(table, MigrationEvent::SkippedNoRequiredFk);
                continue;
            }
            entities.push(entity);
        }
        entities
    }

    /// Rows per table after the run, tenant-scoped where possible. A table
    /// that cannot be counted is left out of the report.
    async fn count_rows(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for table in self.graph.insertion_order() {
            let filter = match self.config.table(table).and_then(|t| t.tenant_column.as_ref()) {
                Some(column) => Filter::eq(column, &self.config.tenant_id),
                None => Filter::All,
            };
            match self.target.select_where(table, &filter, &Projection::CountOnly).await {
                Ok(selected) => {
                    counts.insert(table.clone(), selected.count());
                },
                Err(e) => warn!(table = %table, error = %e, "Could not count target rows"),
            }
        }
        counts
    }
}

/// Turn each parent's nested `child_type` list into standalone records that
/// carry the parent (minus its child lists) under `_parent`. Also returns the
/// number of items that were not objects and so cannot become records.
fn flatten_children(parents: &[SourceRecord], child_type: &str) -> (Vec<SourceRecord>, u64) {
    let mut children = Vec::new();
    let mut malformed = 0;
    for parent in parents {
        let Some(Value::Array(items)) = parent.fields().get(child_type) else {
            continue;
        };
        let context = Value::Object(parent.without_fields(&[child_type.to_string()]).into_fields());
        for item in items {
            match SourceRecord::from_value(item.clone()) {
                Some(child) => children.push(child.with_field(PARENT_FIELD, context.clone())),
                None => malformed += 1,
            }
        }
    }
    (children, malformed)
}
