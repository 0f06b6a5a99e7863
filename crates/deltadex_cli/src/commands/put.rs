//! Record mutation commands.

use super::{open_engine, parse_assignments};
use deltadex_core::{MutationReport, RecordId};
use std::path::Path;

/// Inserts a record, or updates it if it exists.
pub fn run(
    path: &Path,
    table: &str,
    id: u64,
    assignments: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let id = RecordId::new(id);
    let columns = parse_assignments(assignments)?;

    let report = if engine.get(table, id).is_some() {
        engine.update(table, id, columns)?
    } else {
        engine.insert(table, id, columns)?
    };
    print_report(&report);
    Ok(())
}

/// Deletes a record.
pub fn delete(path: &Path, table: &str, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let report = engine.delete(table, RecordId::new(id))?;
    print_report(&report);
    Ok(())
}

/// Marks a record dirty without changing it.
pub fn touch(path: &Path, entity: &str, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let report = engine.touch(entity, RecordId::new(id))?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &MutationReport) {
    println!(
        "{} {} at {}{}",
        report.table,
        report.id,
        report.revision,
        if report.dirty { " (dirty)" } else { "" }
    );
    for (owner, id) in &report.propagated {
        println!("  touched {owner} {id}");
    }
    for (entity, build) in &report.built {
        println!("  {entity} delta: {build:?}");
    }
    for job in &report.enqueued {
        println!("  queued {job}");
    }
    for error in &report.build_errors {
        eprintln!("  build failed: {error}");
    }
}
