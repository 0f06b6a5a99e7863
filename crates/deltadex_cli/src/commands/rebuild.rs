//! Rebuild command implementations.

use super::open_engine;
use deltadex_core::{DeltaBuild, RebuildReport, SegmentKind, TriggerReason};
use std::path::Path;
use tracing::info;

/// Rebuilds core indexes (and their deltas), or enqueues the rebuilds.
pub fn run(
    path: &Path,
    entity: Option<&str>,
    enqueue: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let names: Vec<String> = match entity {
        Some(name) => vec![engine.entity(name)?.name.clone()],
        None => engine.entities().map(|e| e.name.clone()).collect(),
    };

    if enqueue {
        for name in &names {
            let job = engine.enqueue_build(name, SegmentKind::Core, TriggerReason::Operator)?;
            println!("Queued {job} (core rebuild of {name})");
        }
        return Ok(());
    }

    let mut options = engine.config().build.clone();
    options.quiet |= quiet;
    info!("Rebuilding {} entities", names.len());
    for name in &names {
        let report = engine.rebuild_core_with(name, &options)?;
        print_rebuild(&report);
    }
    Ok(())
}

/// Rebuilds delta indexes only.
pub fn delta(
    path: &Path,
    entity: Option<&str>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let mut options = engine.config().build.clone();
    options.quiet |= quiet;

    let builds = match entity {
        Some(name) => vec![(name.to_string(), engine.build_delta_with(name, &options)?)],
        None => engine.rebuild_deltas_with(&options)?,
    };
    if builds.is_empty() {
        println!("No entity has a delta index");
    }
    for (name, build) in &builds {
        println!("{name}: {}", describe(build));
    }
    Ok(())
}

fn print_rebuild(report: &RebuildReport) {
    println!(
        "{}: core {} with {} documents (snapshot {})",
        report.entity, report.generation, report.documents, report.snapshot_sequence
    );
    println!(
        "  cleared {} dirty, purged {} tombstones, {} still dirty",
        report.cleaned.cleared, report.cleaned.purged, report.cleaned.still_dirty
    );
    println!("  delta: {}", describe(&report.delta));
}

fn describe(build: &DeltaBuild) -> String {
    match build {
        DeltaBuild::Built {
            generation,
            documents,
            kills,
        } => format!("built {generation} ({documents} documents, {kills} kills)"),
        DeltaBuild::Unchanged => "unchanged".to_string(),
        DeltaBuild::NoDelta => "no delta configured".to_string(),
    }
}
