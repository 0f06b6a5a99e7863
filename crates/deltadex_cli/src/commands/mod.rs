//! CLI command implementations.

pub mod init;
pub mod migrate;
pub mod put;
pub mod rebuild;
pub mod search;
pub mod status;
pub mod work;

use deltadex_core::{Engine, EngineConfig};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the configuration file inside an index directory.
pub const CONFIG_FILE: &str = "config.json";

/// Returns the configuration path of an index directory.
pub fn config_path(path: &Path) -> PathBuf {
    path.join(CONFIG_FILE)
}

/// Loads the configuration stored by `init`.
pub fn load_config(path: &Path) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config_path = config_path(path);
    if !config_path.exists() {
        return Err(format!("No deltadex index at {:?} (run `deltadex init`)", path).into());
    }
    let text = fs::read_to_string(&config_path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Opens the engine of an initialized index directory.
pub fn open_engine(path: &Path) -> Result<Engine, Box<dyn std::error::Error>> {
    open_engine_with(path, load_config(path)?)
}

/// Opens the engine with an adjusted configuration, warning about disabled
/// entities.
pub fn open_engine_with(
    path: &Path,
    config: EngineConfig,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let engine = Engine::open(path, config)?;
    for (entity, reason) in engine.disabled_entities() {
        eprintln!("warning: entity {entity} is disabled: {reason}");
    }
    Ok(engine)
}

/// Parses `column=value` assignments.
pub fn parse_assignments(
    assignments: &[String],
) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    assignments
        .iter()
        .map(|assignment| match assignment.split_once('=') {
            Some((column, value)) if !column.is_empty() => {
                Ok((column.to_string(), value.to_string()))
            }
            _ => Err(format!("Invalid assignment {assignment:?} (expected column=value)").into()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_split_on_first_equals() {
        let parsed =
            parse_assignments(&["title=a=b".to_string(), "body=".to_string()]).unwrap();
        assert_eq!(parsed["title"], "a=b");
        assert_eq!(parsed["body"], "");
    }

    #[test]
    fn assignments_need_a_column() {
        assert!(parse_assignments(&["=x".to_string()]).is_err());
        assert!(parse_assignments(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn init_writes_a_loadable_config() {
        let temp = tempfile::tempdir().unwrap();
        let schema = temp.path().join("schema.json");
        fs::write(
            &schema,
            r#"{
                "tables": [{ "name": "articles", "columns": ["title", "delta"] }],
                "entities": [{
                    "name": "articles",
                    "delta": "true",
                    "fields": [{ "name": "title", "from": "column", "column": "title" }]
                }]
            }"#,
        )
        .unwrap();
        let index = temp.path().join("index");

        init::run(&index, Some(&schema), false).unwrap();
        assert!(init::run(&index, None, false).is_err());

        let engine = open_engine(&index).unwrap();
        assert!(engine.disabled_entities().is_empty());
        assert_eq!(engine.entity("articles").unwrap().delta.label(), "immediate");
    }

    #[test]
    fn missing_index_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        assert!(load_config(temp.path()).is_err());
    }
}
