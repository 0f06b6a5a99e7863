//! Status and jobs command implementations.

use super::open_engine;
use deltadex_core::{EngineStatus, JobState, SlotStatus};
use std::path::Path;

/// Shows per-entity index state and queue counts.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let status = engine.status()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&status)?),
        _ => print_text_output(path, &status),
    }
    Ok(())
}

fn print_text_output(path: &Path, status: &EngineStatus) {
    println!("deltadex Index Status");
    println!("=====================");
    println!();
    println!("Path:     {}", path.display());
    println!("Sequence: {}", status.sequence);
    println!();
    println!("Entities:");
    for entity in &status.entities {
        println!(
            "  {} ({} delta): {} records, {} dirty",
            entity.name, entity.strategy, entity.records, entity.dirty
        );
        println!("    core:  {}", describe_slot(&entity.core));
        println!("    delta: {}", describe_slot(&entity.delta));
    }
    if !status.disabled.is_empty() {
        println!();
        println!("Disabled:");
        for (name, reason) in &status.disabled {
            println!("  {name}: {reason}");
        }
    }
    println!();
    println!("Jobs:");
    println!("  Queued:    {}", status.jobs.queued);
    println!("  Running:   {}", status.jobs.running);
    println!("  Completed: {}", status.jobs.completed);
    println!("  Failed:    {}", status.jobs.failed);
}

fn describe_slot(slot: &SlotStatus) -> String {
    match (&slot.generation, &slot.error) {
        (_, Some(error)) => format!("{} ({error})", slot.state),
        (Some(generation), None) => format!(
            "{} {generation}, {} documents, {} kills",
            slot.state, slot.documents, slot.kills
        ),
        (None, None) => slot.state.to_string(),
    }
}

/// Lists build jobs, optionally requeueing failed ones.
pub fn jobs(path: &Path, retry: bool, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;

    if retry {
        let requeued = engine.retry_failed()?;
        println!("Requeued {} failed builds", requeued.len());
    }

    let jobs = engine.queue().jobs();
    let shown: Vec<_> = jobs
        .iter()
        .filter(|job| all || !matches!(job.state, JobState::Completed))
        .collect();
    if shown.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in shown {
        println!(
            "{} {} {} [{}] reason={} attempts={}",
            job.id, job.entity, job.target, job.state, job.reason, job.attempts
        );
        if let JobState::Failed { error } = &job.state {
            println!("    {error}");
        }
    }
    Ok(())
}
