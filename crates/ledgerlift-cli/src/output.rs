//! Human-readable rendering of run reports and cleanup plans

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use ledgerlift_engine::cleanup::{CleanupPlan, CleanupReport, TableOutcome};
use ledgerlift_engine::report::RunReport;

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).apply_modifier(UTF8_ROUND_CORNERS);
    table
}

/// Per-table counters of a run
pub fn report_table(report: &RunReport) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Table",
        "Seen",
        "Inserted",
        "Already migrated",
        "No identity",
        "No required FK",
        "Insert errors",
        "Skip rate",
        "Target rows",
    ]);

    for t in &report.tables {
        let c = &t.counters;
        let target_rows = report
            .target_row_counts
            .get(&t.table)
            .map_or_else(|| "-".to_string(), u64::to_string);
        table.add_row(vec![
            t.table.clone(),
            c.seen.to_string(),
            c.inserted.to_string(),
            c.already_migrated.to_string(),
            c.skipped_no_identity.to_string(),
            c.skipped_no_required_fk.to_string(),
            c.insert_errors.to_string(),
            format!("{:.1}%", t.skip_rate * 100.0),
            target_rows,
        ]);
    }
    table
}

pub fn print_report(report: &RunReport) {
    println!();
    println!("{}", format!("Migration run {}", report.run_id).cyan().bold());
    println!("  Tenant:   {}", report.tenant_id);
    println!("  Started:  {}", report.started_at);
    println!("  Finished: {}", report.finished_at);
    println!();
    println!("{}", report_table(report));

    for extraction in report.extractions.iter().filter(|e| !e.complete) {
        let reason = extraction.error.as_deref().unwrap_or("cancelled");
        println!(
            "{} {} stopped after {} records: {}",
            "!".yellow(),
            extraction.resource,
            extraction.records,
            reason
        );
        if extraction.children_missing > 0 {
            println!("  Kept without child records: {}", extraction.children_missing);
        }
        if let Some(path) = &extraction.checkpoint {
            println!("  Checkpoint: {}", path.display());
        }
    }
    for table in &report.flagged_tables {
        println!(
            "{} {} skip rate above {:.0}%",
            "!".yellow(),
            table,
            report.skip_rate_threshold * 100.0
        );
    }
    if report.cancelled {
        println!("{}", "Run was cancelled before all tables were written.".yellow());
    } else if report.totals.insert_errors > 0 {
        println!(
            "{}",
            format!("{} rows failed to insert.", report.totals.insert_errors).red()
        );
    } else {
        println!("{} {} rows inserted", "✓".green(), report.totals.inserted);
    }
}

/// Rows that a plan would delete, in deletion order
pub fn plan_table(plan: &CleanupPlan) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Table", "Rows", "Note"]);
    for step in &plan.steps {
        table.add_row(vec![
            step.table.clone(),
            step.ids.len().to_string(),
            step.error.clone().unwrap_or_default(),
        ]);
    }
    table
}

pub fn cleanup_table(report: &CleanupReport) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Table", "Outcome"]);
    for (name, outcome) in &report.tables {
        let text = match outcome {
            TableOutcome::Deleted { rows } => format!("deleted {rows}"),
            TableOutcome::Empty => "nothing to delete".to_string(),
            TableOutcome::Failed { error } => format!("failed: {error}"),
            TableOutcome::Blocked { by } => format!("blocked by {by}"),
        };
        table.add_row(vec![name.clone(), text]);
    }
    table
}
