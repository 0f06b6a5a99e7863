//! Migrate command implementation.

use deltadex_core::Engine;
use std::path::Path;
use tracing::info;

/// Adds a column to a table.
///
/// The stored configuration is not changed; entities that were disabled for
/// a missing dirty column are enabled again on the next open.
pub fn run(path: &Path, table: &str, column: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    info!("Adding column {} to {}", column, table);
    let disabled_before = {
        let engine = Engine::open(path, config.clone())?;
        if engine.add_column(table, column)? {
            println!("Added column {column} to {table}");
        } else {
            println!("Table {table} already has column {column}");
        }
        engine.disabled_entities().clone()
    };

    let reopened = Engine::open(path, config)?;
    for entity in reopened.entities() {
        if disabled_before.contains_key(&entity.name) {
            println!("Entity {} is now enabled", entity.name);
        }
    }
    Ok(())
}
