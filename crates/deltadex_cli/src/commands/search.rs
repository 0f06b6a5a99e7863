//! Search command implementation.

use super::open_engine;
use deltadex_core::SearchResult;
use std::path::Path;

/// Runs a query against an entity.
pub fn run(
    path: &Path,
    entity: &str,
    query: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let result = engine.search(entity, query)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(entity, &result),
    }
    Ok(())
}

fn print_text_output(entity: &str, result: &SearchResult) {
    if let Some(reason) = &result.degraded {
        println!("warning: degraded results ({reason})");
    }
    println!(
        "{} hits in {} (core {}, delta {})",
        result.hits.len(),
        entity,
        generation(result.core_generation),
        generation(result.delta_generation)
    );
    for hit in &result.hits {
        println!("  {} [{} {}]", hit.id, hit.source, hit.revision);
        for (field, value) in &hit.fields {
            if !value.is_empty() {
                println!("    {field}: {}", truncate(value, 72));
            }
        }
    }
}

fn generation(generation: Option<deltadex_core::Generation>) -> String {
    generation.map_or_else(|| "-".to_string(), |g| g.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
