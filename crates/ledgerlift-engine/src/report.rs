//! Reconciliation reporting
//!
//! Counters are append-only: the [`Reporter`] only ever increments them, and
//! every exclusion has a named counter so nothing is dropped silently.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::source::extract::ExtractionSummary;

/// Per-table counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCounters {
    pub seen: u64,
    pub skipped_no_identity: u64,
    pub skipped_no_required_fk: u64,
    pub inserted: u64,
    pub insert_errors: u64,
    /// Record already linked to a target row by an earlier run
    pub already_migrated: u64,
    /// Same source id seen twice in this run
    pub duplicates: u64,
    /// Optional reference written as null
    pub unresolved_optional_fk: u64,
    pub ambiguous_matches: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub batch_retries: u64,
    /// Left unwritten because the run was cancelled
    pub not_attempted: u64,
}

impl MigrationCounters {
    /// Share of seen records that were skipped
    pub fn skip_rate(&self) -> f64 {
        if self.seen == 0 {
            return 0.0;
        }
        (self.skipped_no_identity + self.skipped_no_required_fk) as f64 / self.seen as f64
    }

    fn add(&mut self, other: &MigrationCounters) {
        self.seen += other.seen;
        self.skipped_no_identity += other.skipped_no_identity;
        self.skipped_no_required_fk += other.skipped_no_required_fk;
        self.inserted += other.inserted;
        self.insert_errors += other.insert_errors;
        self.already_migrated += other.already_migrated;
        self.duplicates += other.duplicates;
        self.unresolved_optional_fk += other.unresolved_optional_fk;
        self.ambiguous_matches += other.ambiguous_matches;
        self.batches_written += other.batches_written;
        self.batches_failed += other.batches_failed;
        self.batch_retries += other.batch_retries;
        self.not_attempted += other.not_attempted;
    }
}

/// Something that happened to a record or batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationEvent {
    Seen,
    SkippedNoIdentity,
    SkippedNoRequiredFk,
    AlreadyMigrated,
    Duplicate,
    UnresolvedOptionalFk,
    AmbiguousMatch,
    BatchWritten { rows: u64 },
    /// Whole batch marked failed; `inserted` rows of a partial write still
    /// made it into the target
    BatchFailed { failed: u64, inserted: u64 },
    BatchRetried,
    NotAttempted { rows: u64 },
}

/// Accumulates counters per table in first-seen order
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tables: Vec<(String, MigrationCounters)>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters_mut(&mut self, table: &str) -> &mut MigrationCounters {
        let index = match self.tables.iter().position(|(t, _)| t == table) {
            Some(index) => index,
            None => {
                self.tables.push((table.to_string(), MigrationCounters::default()));
                self.tables.len() - 1
            },
        };
        &mut self.tables[index].1
    }

    /// Make sure a table shows up in the summary even with no events
    pub fn touch(&mut self, table: &str) {
        self.counters_mut(table);
    }

    pub fn record(&mut self, table: &str, event: MigrationEvent) {
        let c = self.counters_mut(table);
        match event {
            MigrationEvent::Seen => c.seen += 1,
            MigrationEvent::SkippedNoIdentity => c.skipped_no_identity += 1,
            MigrationEvent::SkippedNoRequiredFk => c.skipped_no_required_fk += 1,
            MigrationEvent::AlreadyMigrated => c.already_migrated += 1,
            MigrationEvent::Duplicate => c.duplicates += 1,
            MigrationEvent::UnresolvedOptionalFk => c.unresolved_optional_fk += 1,
            MigrationEvent::AmbiguousMatch => c.ambiguous_matches += 1,
            MigrationEvent::BatchWritten { rows } => {
                c.batches_written += 1;
                c.inserted += rows;
            },
            MigrationEvent::BatchFailed { failed, inserted } => {
                c.batches_failed += 1;
                c.insert_errors += failed;
                c.inserted += inserted;
            },
            MigrationEvent::BatchRetried => c.batch_retries += 1,
            MigrationEvent::NotAttempted { rows } => c.not_attempted += rows,
        }
    }

    /// Snapshot for one table
    pub fn counters(&self, table: &str) -> MigrationCounters {
        self.tables
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    /// Snapshot of every table, in first-seen order
    pub fn summary(&self) -> Vec<(String, MigrationCounters)> {
        self.tables.clone()
    }

    pub fn totals(&self) -> MigrationCounters {
        let mut total = MigrationCounters::default();
        for (_, c) in &self.tables {
            total.add(c);
        }
        total
    }

    /// Tables whose skip rate is above `threshold`
    pub fn flagged(&self, threshold: f64) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, c)| c.skip_rate() > threshold)
            .map(|(t, _)| t.clone())
            .collect()
    }
}

/// Counters of one table as persisted in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    #[serde(flatten)]
    pub counters: MigrationCounters,
    pub skip_rate: f64,
}

/// Persisted artifact of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub cancelled: bool,
    pub tables: Vec<TableReport>,
    pub totals: MigrationCounters,
    /// Rows per table in the target after the run, tenant-scoped
    pub target_row_counts: BTreeMap<String, u64>,
    pub extractions: Vec<ExtractionSummary>,
    pub skip_rate_threshold: f64,
    /// Tables whose skip rate exceeded the threshold; reported, not enforced
    pub flagged_tables: Vec<String>,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        run_id: Uuid,
        tenant_id: &str,
        started_at: DateTime<Utc>,
        reporter: &Reporter,
        target_row_counts: BTreeMap<String, u64>,
        extractions: Vec<ExtractionSummary>,
        skip_rate_threshold: f64,
        cancelled: bool,
    ) -> Self {
        Self {
            run_id,
            tenant_id: tenant_id.to_string(),
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            cancelled,
            tables: reporter
                .summary()
                .into_iter()
                .map(|(table, counters)| TableReport {
                    table,
                    skip_rate: counters.skip_rate(),
                    counters,
                })
                .collect(),
            totals: reporter.totals(),
            target_row_counts,
            extractions,
            skip_rate_threshold,
            flagged_tables: reporter.flagged(skip_rate_threshold),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json(&self, path: &Path) -> ledgerlift_common::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
