//! Init command implementation.

use super::config_path;
use deltadex_core::{Engine, EngineConfig};
use std::fs;
use std::path::Path;
use tracing::info;

/// Creates an index directory and stores its configuration.
///
/// Without a schema file an empty configuration is written; tables and
/// entities can be added by editing `config.json`.
pub fn run(
    path: &Path,
    schema: Option<&Path>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = config_path(path);
    if target.exists() && !force {
        return Err(format!("{:?} already exists (use --force to replace)", target).into());
    }

    let config: EngineConfig = match schema {
        Some(schema) => serde_json::from_str(&fs::read_to_string(schema)?)?,
        None => EngineConfig::default(),
    };

    fs::create_dir_all(path)?;
    fs::write(&target, serde_json::to_string_pretty(&config)?)?;
    info!("Wrote configuration to {:?}", target);

    let engine = Engine::open(path, config)?;
    println!("Initialized deltadex index at {}", path.display());
    for entity in engine.entities() {
        println!(
            "  {} ({} delta, {} fields)",
            entity.name,
            entity.delta.label(),
            entity.fields.len()
        );
    }
    for (entity, reason) in engine.disabled_entities() {
        println!("  {entity} DISABLED: {reason}");
    }
    Ok(())
}
