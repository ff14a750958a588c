//! Build automation tasks for ledgerlift
//!
//! - Generating the CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for ledgerlift", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<ledgerlift_cli::Cli>();

    let content = format!(
        r#"# ledgerlift CLI Reference

Generated from the CLI source code on {}.

## Quick Start

```bash
# Check the configuration and see the table order
LEDGERLIFT_TENANT_ID=<tenant uuid> ledgerlift validate-config

# Rehearse a migration in memory
ledgerlift migrate --export-dir ./export --dry-run

# Migrate into PostgreSQL
DATABASE_URL=postgres://localhost/ledger ledgerlift migrate --export-dir ./export

# Show what rolling back one customer would delete, then do it
ledgerlift rollback --table customers --ids <uuid>
ledgerlift rollback --table customers --ids <uuid> --yes
```

## Commands

{}

## Environment Variables

- `LEDGERLIFT_CONFIG` - Migration configuration file (TOML)
- `LEDGERLIFT_TENANT_ID` - Target tenant, overrides `tenant_id` from the file
- `LEDGERLIFT_BATCH_SIZE` - Rows per insert batch
- `LEDGERLIFT_CHECKPOINT_DIR` - Where partial extractions are written
- `DATABASE_URL` - PostgreSQL connection string
- `LOG_LEVEL`, `LOG_FORMAT`, `LOG_OUTPUT`, `LOG_DIR`, `LOG_FILTER` - Logging

A `.env` file in the working directory is read on startup.

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("✅ Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
