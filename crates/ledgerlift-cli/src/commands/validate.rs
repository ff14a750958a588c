//! `ledgerlift validate-config` command implementation

use crate::error::Result;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use ledgerlift_engine::config::MigrationConfig;

pub fn run(config: &MigrationConfig, print: bool) -> Result<()> {
    let graph = config.validate()?;

    if print {
        println!("{}", toml::to_string_pretty(config)?);
        return Ok(());
    }

    println!("{} Configuration is valid", "✓".green());
    println!("  Tenant:     {}", config.tenant_id);
    println!("  Batch size: {}", config.batch_size);
    println!("  Page size:  {}", config.page_size);
    println!(
        "  Retry:      {} attempts, {}ms {:?} backoff",
        config.retry.max_attempts, config.retry.backoff_ms, config.retry.backoff
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["#", "Table", "Source", "References"]);

    for (position, name) in graph.insertion_order().iter().enumerate() {
        let source = config
            .table(name)
            .and_then(|t| t.source.as_ref())
            .map(|b| match &b.nested_under {
                Some(child) => format!("{}.{}", b.resource, child),
                None => b.resource.clone(),
            })
            .unwrap_or_else(|| "-".to_string());
        let references: Vec<String> = graph
            .parents_of(name)
            .map(|e| {
                let marker = if e.required { "" } else { "?" };
                format!("{} -> {}{}", e.foreign_key_field, e.parent_table, marker)
            })
            .collect();
        table.add_row(vec![
            (position + 1).to_string(),
            name.clone(),
            source,
            references.join(", "),
        ]);
    }

    println!("{}", "Insertion order:".cyan().bold());
    println!("{}", table);
    Ok(())
}
