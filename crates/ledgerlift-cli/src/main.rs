//! Ledgerlift CLI - Main entry point

use anyhow::Context;
use clap::Parser;
use ledgerlift_cli::{Cli, Commands};
use ledgerlift_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Values from .env apply to clap's env fallbacks too
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("ledgerlift")
        .build();
    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = ledgerlift_cli::config::load(cli.config.as_deref())
        .map_err(ledgerlift_cli::CliError::from)
        .context("Failed to load configuration")?;

    match &cli.command {
        Commands::Migrate(args) => ledgerlift_cli::commands::migrate::run(&config, args).await?,
        Commands::Rollback(args) => ledgerlift_cli::commands::rollback::run(&config, args).await?,
        Commands::ValidateConfig { print } => ledgerlift_cli::commands::validate::run(&config, *print)?,
    }
    Ok(())
}
