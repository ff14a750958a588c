//! `ledgerlift migrate` command implementation

use crate::commands::{cancel_on_ctrl_c, connect};
use crate::config::child_types;
use crate::error::{CliError, Result};
use crate::output;
use crate::MigrateArgs;
use colored::Colorize;
use ledgerlift_engine::config::MigrationConfig;
use ledgerlift_engine::pipeline::{MigrationOutcome, MigrationRun};
use ledgerlift_engine::source::JsonExportSource;
use ledgerlift_engine::target::{MemoryStore, TargetStore};
use ledgerlift_engine::EngineError;
use std::path::PathBuf;
use tracing::info;

/// Default directory for run reports
pub const REPORT_DIR: &str = "reports";

pub async fn run(config: &MigrationConfig, args: &MigrateArgs) -> Result<()> {
    let graph = config.validate()?;
    let source = JsonExportSource::open(&args.export_dir, &child_types(config))
        .await
        .map_err(EngineError::from)?;
    info!(export_dir = %args.export_dir.display(), dry_run = args.dry_run, "Starting migration");

    let outcome = if args.dry_run {
        if !args.json {
            println!("{}", "Dry run: writing to an in-memory target".yellow());
        }
        let store = MemoryStore::new(graph);
        execute(config, &source, &store).await?
    } else {
        let store = connect(&args.database).await?;
        execute(config, &source, &store).await?
    };

    let path = args
        .report
        .clone()
        .unwrap_or_else(|| PathBuf::from(REPORT_DIR).join(format!("{}.json", outcome.report.run_id)));
    outcome.report.write_json(&path).map_err(CliError::Report)?;

    if args.json {
        println!("{}", outcome.report.to_json()?);
    } else {
        output::print_report(&outcome.report);
        println!("  Report: {}", path.display());
    }
    Ok(())
}

async fn execute(
    config: &MigrationConfig,
    source: &JsonExportSource,
    store: &dyn TargetStore,
) -> Result<MigrationOutcome> {
    let outcome = MigrationRun::new(config, source, store)?
        .with_cancellation(cancel_on_ctrl_c())
        .run()
        .await?;
    Ok(outcome)
}
