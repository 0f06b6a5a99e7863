//! Work command implementation.

use super::{load_config, open_engine_with};
use deltadex_core::Worker;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Runs the build worker.
///
/// With `once`, drains the queue (after enqueueing due threshold builds) and
/// exits. Otherwise loops until the process is killed; jobs left running
/// are requeued by the next worker.
pub fn run(
    path: &Path,
    once: bool,
    poll_ms: Option<u64>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(path)?;
    if let Some(ms) = poll_ms {
        config.worker.poll_interval = Duration::from_millis(ms);
    }
    config.build.quiet |= quiet;
    let engine = Arc::new(open_engine_with(path, config)?);
    let worker = Worker::new(engine)?;

    if once {
        let report = worker.tick()?;
        println!(
            "Ran {} jobs ({} completed, {} failed)",
            report.total(),
            report.completed.len(),
            report.failed.len()
        );
        return Ok(());
    }

    info!("Worker running on {:?}", path);
    worker.run(&AtomicBool::new(false));
    Ok(())
}
