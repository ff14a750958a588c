//! `ledgerlift rollback` command implementation
//!
//! Shows the cascading cleanup plan for the selected rows; with `--yes` the
//! plan is executed children-first.

use crate::commands::connect;
use crate::error::{CliError, Result};
use crate::output;
use crate::RollbackArgs;
use chrono::{DateTime, Utc};
use colored::Colorize;
use ledgerlift_engine::cleanup::{CleanupEngine, Selection, TableOutcome};
use ledgerlift_engine::config::MigrationConfig;
use ledgerlift_engine::model::TargetId;
use tracing::info;

/// Turn the `--ids` / `--since` arguments into a selection
pub fn selection(args: &RollbackArgs) -> Result<Selection> {
    match &args.since {
        Some(raw) => {
            let at = DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|_| CliError::InvalidTimestamp(raw.clone()))?
                .with_timezone(&Utc);
            Ok(Selection::InsertedSince(at))
        },
        None => Ok(Selection::Ids(
            args.ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(TargetId::from)
                .collect(),
        )),
    }
}

pub async fn run(config: &MigrationConfig, args: &RollbackArgs) -> Result<()> {
    let graph = config.validate()?;
    let selection = selection(args)?;
    let store = connect(&args.database).await?;
    let engine = CleanupEngine::new(&store, &graph, config);

    let ids = engine.select_targets(&args.table, &selection).await?;
    if ids.is_empty() {
        println!("No {} rows match the selection for tenant {}.", args.table, config.tenant_id);
        return Ok(());
    }

    let plan = engine.plan(&args.table, &ids).await?;
    println!("{}", format!("Cleanup plan rooted at {}", plan.root_table).cyan().bold());
    println!("{}", output::plan_table(&plan));
    println!("  Total rows: {}", plan.total_rows());

    if !args.yes {
        println!();
        println!("{}", "Nothing deleted. Re-run with --yes to execute this plan.".yellow());
        return Ok(());
    }

    info!(table = %args.table, rows = plan.total_rows(), "Executing cleanup plan");
    let report = engine.execute(&plan).await;
    println!("{}", output::cleanup_table(&report));

    if report.is_success() {
        println!("{} {} rows deleted", "✓".green(), report.total_deleted());
        Ok(())
    } else {
        let unfinished: Vec<String> = report
            .tables
            .iter()
            .filter(|(_, o)| matches!(o, TableOutcome::Failed { .. } | TableOutcome::Blocked { .. }))
            .map(|(t, _)| t.clone())
            .collect();
        Err(CliError::Incomplete(unfinished.join(", ")))
    }
}
