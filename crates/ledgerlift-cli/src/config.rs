//! Loading the migration configuration
//!
//! Precedence, lowest first: built-in defaults, the TOML file given with
//! `--config`, then environment variables (a `.env` file is read first).

use ledgerlift_common::{LiftError, Result};
use ledgerlift_engine::config::MigrationConfig;
use std::path::Path;
use tracing::debug;

// ============================================================================
// Environment Variables
// ============================================================================

/// Target tenant identifier
pub const TENANT_ENV: &str = "LEDGERLIFT_TENANT_ID";

/// Rows per insert batch
pub const BATCH_SIZE_ENV: &str = "LEDGERLIFT_BATCH_SIZE";

/// Directory for partial extraction checkpoints
pub const CHECKPOINT_DIR_ENV: &str = "LEDGERLIFT_CHECKPOINT_DIR";

/// Read the configuration file (if any) and apply environment overrides.
/// The result is not validated yet.
pub fn load(path: Option<&Path>) -> Result<MigrationConfig> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(LiftError::NotFound(path.to_path_buf()));
            }
            let text = std::fs::read_to_string(path)?;
            let config = parse(&text).map_err(|source| LiftError::Toml {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), tables = config.tables.len(), "Configuration file loaded");
            config
        },
        None => MigrationConfig::default(),
    };
    apply_env(config, |key| std::env::var(key).ok())
}

pub fn parse(text: &str) -> std::result::Result<MigrationConfig, toml::de::Error> {
    toml::from_str(text)
}

/// Apply overrides looked up through `var`
pub fn apply_env(mut config: MigrationConfig, var: impl Fn(&str) -> Option<String>) -> Result<MigrationConfig> {
    if let Some(tenant) = var(TENANT_ENV).filter(|t| !t.trim().is_empty()) {
        config.tenant_id = tenant.trim().to_string();
    }
    if let Some(raw) = var(BATCH_SIZE_ENV) {
        config.batch_size = raw
            .trim()
            .parse()
            .map_err(|_| LiftError::config(format!("{BATCH_SIZE_ENV} must be a positive integer, got '{raw}'")))?;
    }
    if let Some(dir) = var(CHECKPOINT_DIR_ENV) {
        config.checkpoint_dir = Some(dir.into());
    }
    Ok(config)
}

/// Every nested child collection named by the configured tables
pub fn child_types(config: &MigrationConfig) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for binding in config.tables.iter().filter_map(|t| t.source.as_ref()) {
        for child in config.child_types_of(&binding.resource) {
            if !types.contains(&child) {
                types.push(child);
            }
        }
    }
    types
}
