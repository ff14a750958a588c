//! Constraint-aware batch writer
//!
//! Entities are written in bounded batches, one bulk insert per batch. A
//! batch never contains an entity with a missing required foreign key; such
//! entities are counted and left out before the batch is built. Transient
//! failures are retried with backoff, permanent ones fail the batch at once,
//! and in both cases the run moves on to the next batch.

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{RetryPolicy, TableSpec};
use crate::identity::IdentityResolver;
use crate::model::{scalar_to_string, CanonicalEntity, Row, TargetId};
use crate::report::{MigrationEvent, Reporter};
use crate::retry::with_retry;
use crate::target::TargetStore;

/// Ordered, bounded group of entities of one table whose required foreign
/// keys are all present
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    table: String,
    entities: Vec<CanonicalEntity>,
}

impl Batch {
    /// Build a batch, diverting every entity that lacks a required column
    /// to the returned reject list
    pub fn build(
        table: &str,
        entities: Vec<CanonicalEntity>,
        required: &[&str],
    ) -> (Self, Vec<CanonicalEntity>) {
        let (entities, rejected): (Vec<_>, Vec<_>) = entities
            .into_iter()
            .partition(|e| e.table == table && required.iter().all(|column| e.has_value(column)));
        (
            Self {
                table: table.to_string(),
                entities,
            },
            rejected,
        )
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn entities(&self) -> &[CanonicalEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn rows(&self) -> Vec<Row> {
        self.entities.iter().map(CanonicalEntity::to_row).collect()
    }
}

/// What happened to the entities handed to [`BatchWriter::write_all`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    /// `(source_id, target_id)` of every stored row
    pub inserted: Vec<(String, TargetId)>,
    pub failed: usize,
    pub skipped_no_required_fk: usize,
    pub not_attempted: usize,
    pub batches_written: usize,
    pub batches_failed: usize,
}

pub struct BatchWriter<'a> {
    store: &'a dyn TargetStore,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn TargetStore, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write `entities` into `spec.name`. Stored rows are registered with the
    /// resolver and every outcome is recorded with the reporter.
    #[instrument(skip_all, fields(table = %spec.name, entities = entities.len()))]
    pub async fn write_all(
        &self,
        entities: Vec<CanonicalEntity>,
        spec: &TableSpec,
        resolver: &mut IdentityResolver,
        reporter: &mut Reporter,
    ) -> WriteResult {
        let table = spec.name.as_str();
        let required: Vec<&str> = spec
            .foreign_keys
            .iter()
            .filter(|fk| fk.required)
            .map(|fk| fk.column.as_str())
            .collect();

        let mut result = WriteResult::default();
        let mut pending = entities.into_iter().peekable();
        let mut batch_number = 0usize;

        while pending.peek().is_some() {
            if self.cancel.is_cancelled() {
                let remaining = pending.count();
                warn!(table, remaining, "Write cancelled before next batch");
                reporter.record(table, MigrationEvent::NotAttempted { rows: remaining as u64 });
                result.not_attempted += remaining;
                break;
            }

            let chunk: Vec<CanonicalEntity> = pending.by_ref().take(self.batch_size).collect();
            let (batch, rejected) = Batch::build(table, chunk, &required);
            for entity in &rejected {
                debug!(table, source_id = %entity.source_id, "Entity missing a required foreign key");
                reporter.record(table, MigrationEvent::SkippedNoRequiredFk);
            }
            result.skipped_no_required_fk += rejected.len();
            if batch.is_empty() {
                continue;
            }

            batch_number += 1;
            self.write_batch(batch_number, &batch, spec, resolver, reporter, &mut result)
                .await;
        }

        info!(
            table,
            inserted = result.inserted.len(),
            failed = result.failed,
            skipped = result.skipped_no_required_fk,
            "Table write finished"
        );
        result
    }

    async fn write_batch(
        &self,
        number: usize,
        batch: &Batch,
        spec: &TableSpec,
        resolver: &mut IdentityResolver,
        reporter: &mut Reporter,
        result: &mut WriteResult,
    ) {
        let table = batch.table();
        let rows = batch.rows();
        let label = format!("Insert {} batch {} ({} rows)", table, number, rows.len());
        let outcome = with_retry(&self.retry, &label, |_| self.store.insert_batch(table, &rows)).await;
        for _ in 0..outcome.retries() {
            reporter.record(table, MigrationEvent::BatchRetried);
        }

        match outcome.result {
            Ok(returned) => {
                let linked = link_returned(batch, &returned, spec, resolver);
                let stored = linked.len();
                result.inserted.extend(linked);
                if stored < batch.len() {
                    let failed = batch.len() - stored;
                    error!(table, batch = number, stored, failed, "Batch partially written");
                    reporter.record(
                        table,
                        MigrationEvent::BatchFailed {
                            failed: failed as u64,
                            inserted: stored as u64,
                        },
                    );
                    result.failed += failed;
                    result.batches_failed += 1;
                } else {
                    debug!(table, batch = number, rows = stored, "Batch written");
                    reporter.record(table, MigrationEvent::BatchWritten { rows: stored as u64 });
                    result.batches_written += 1;
                }
            },
            Err(e) => {
                error!(
                    table,
                    batch = number,
                    rows = batch.len(),
                    attempts = outcome.attempts,
                    error = %e,
                    "Batch failed"
                );
                reporter.record(
                    table,
                    MigrationEvent::BatchFailed {
                        failed: batch.len() as u64,
                        inserted: 0,
                    },
                );
                result.failed += batch.len();
                result.batches_failed += 1;
            },
        }
    }
}

/// Pair returned rows with their entities, by source key column when the
/// store echoes it and by position otherwise, and register them
fn link_returned(
    batch: &Batch,
    returned: &[Row],
    spec: &TableSpec,
    resolver: &mut IdentityResolver,
) -> Vec<(String, TargetId)> {
    let by_key: HashMap<&str, &CanonicalEntity> = batch
        .entities()
        .iter()
        .map(|e| (e.source_id.as_str(), e))
        .collect();

    let mut linked = Vec::with_capacity(returned.len());
    for (position, row) in returned.iter().enumerate() {
        let Some(target_id) = TargetId::from_row(row) else {
            continue;
        };
        let key = row.get(&spec.source_key_column).and_then(scalar_to_string);
        let entity = match key {
            Some(key) => by_key.get(key.as_str()).copied(),
            None => batch.entities().get(position),
        };
        let Some(entity) = entity else {
            continue;
        };

        let secondary = spec
            .secondary_key
            .as_ref()
            .and_then(|s| entity.get(&s.column))
            .and_then(|v| v.as_text());
        resolver.record_inserted(&spec.name, &entity.source_id, target_id.clone(), secondary);
        linked.push((entity.source_id.clone(), target_id));
    }
    linked
}
