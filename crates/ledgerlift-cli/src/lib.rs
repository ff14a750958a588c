//! Ledgerlift CLI Library
//!
//! Command-line front end for the ledgerlift migration engine.
//!
//! # Overview
//!
//! - **Migration**: move a document-store export into the relational target
//!   (`ledgerlift migrate`), or rehearse it in memory (`--dry-run`)
//! - **Rollback**: plan and execute a cascading cleanup of migrated rows
//!   (`ledgerlift rollback`)
//! - **Configuration**: check a configuration file and print the effective
//!   settings (`ledgerlift validate-config`)

pub mod commands;
pub mod config;
pub mod error;
pub mod output;

pub use error::{CliError, Result};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Ledgerlift - document store to relational ledger migration
#[derive(Parser, Debug)]
#[command(name = "ledgerlift")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Migration configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, env = "LEDGERLIFT_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Migrate a JSON export into the target database
    Migrate(MigrateArgs),

    /// Remove migrated rows and everything that references them
    Rollback(RollbackArgs),

    /// Validate the configuration and show the table order
    ValidateConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

/// Target database connection
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Maximum pooled connections
    #[arg(long, default_value = "5")]
    pub max_connections: u32,
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    /// Directory holding one `<resource>.json` file per source collection
    #[arg(short, long)]
    pub export_dir: PathBuf,

    /// Where to write the run report (defaults to reports/<run id>.json)
    #[arg(short, long)]
    pub report: Option<PathBuf>,

    /// Migrate into an in-memory target instead of the database
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run report as JSON instead of a table
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub database: DatabaseArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RollbackArgs {
    /// Root table of the cleanup
    #[arg(short, long)]
    pub table: String,

    /// Target ids to remove (comma separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "since", required_unless_present = "since")]
    pub ids: Vec<String>,

    /// Remove rows created at or after this RFC 3339 instant
    #[arg(long)]
    pub since: Option<String>,

    /// Execute the plan; without this flag only the plan is shown
    #[arg(short, long)]
    pub yes: bool,

    #[command(flatten)]
    pub database: DatabaseArgs,
}
