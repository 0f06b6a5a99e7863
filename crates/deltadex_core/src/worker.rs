//! The build worker.
//!
//! A worker drains the job queue of one engine. There is at most one worker
//! per engine, and with a directory at most one per directory: the second
//! [`Worker::new`] fails with [`CoreError::WorkerLocked`].
//!
//! ```rust,ignore
//! let engine = Arc::new(Engine::open(path, config)?);
//! let handle = Worker::new(Arc::clone(&engine))?.spawn()?;
//! // ... mutations enqueue jobs ...
//! handle.shutdown()?;
//! ```

use crate::dir::WorkerLease;
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::jobs::JobId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs that completed.
    pub completed: Vec<JobId>,
    /// Jobs that failed.
    pub failed: Vec<JobId>,
}

impl DrainReport {
    /// Number of jobs run.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Single consumer of an engine's job queue.
#[derive(Debug)]
pub struct Worker {
    engine: Arc<Engine>,
    _lease: Option<WorkerLease>,
}

impl Worker {
    /// Becomes the engine's worker and requeues jobs a dead worker left
    /// running.
    ///
    /// # Errors
    ///
    /// [`CoreError::WorkerLocked`] if another worker holds the engine or its
    /// directory.
    pub fn new(engine: Arc<Engine>) -> CoreResult<Self> {
        let lease = engine.acquire_worker()?;
        let worker = Self {
            engine,
            _lease: lease,
        };
        let recovered = worker.engine.recover_abandoned_jobs()?;
        if !recovered.is_empty() {
            warn!(jobs = recovered.len(), "requeued jobs abandoned by a previous worker");
        }
        Ok(worker)
    }

    /// Runs jobs until none can be claimed.
    pub fn drain(&self) -> CoreResult<DrainReport> {
        let mut report = DrainReport::default();
        while let Some(outcome) = self.engine.run_next_job()? {
            match outcome.error {
                None => report.completed.push(outcome.job.id),
                Some(_) => report.failed.push(outcome.job.id),
            }
        }
        if report.total() > 0 {
            debug!(
                completed = report.completed.len(),
                failed = report.failed.len(),
                "drained job queue"
            );
        }
        Ok(report)
    }

    /// One loop iteration: catch up, enqueue due threshold builds, drain.
    pub fn tick(&self) -> CoreResult<DrainReport> {
        self.engine.refresh()?;
        if self.engine.config().worker.poll_thresholds {
            self.engine.enqueue_due_thresholds()?;
        }
        self.drain()
    }

    /// Ticks until `shutdown` is set.
    ///
    /// An empty queue does not end the loop; the worker sleeps for the poll
    /// interval (or until unparked) and looks again. Errors from a tick are
    /// logged and the loop continues.
    pub fn run(&self, shutdown: &AtomicBool) {
        let interval = self.engine.config().worker.poll_interval;
        info!(?interval, "worker started");
        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.tick() {
                error!(error = %e, "worker tick failed");
            }
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            thread::park_timeout(interval);
        }
        info!("worker stopped");
    }

    /// Runs the loop on a background thread.
    pub fn spawn(self) -> CoreResult<WorkerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("deltadex-worker".into())
            .spawn(move || self.run(&flag))?;
        Ok(WorkerHandle { shutdown, thread })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.engine.release_worker();
    }
}

/// Handle to a spawned worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wakes the worker early, e.g. after enqueueing.
    pub fn wake(&self) {
        self.thread.thread().unpark();
    }

    /// Stops the worker after its current job and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread panicked.
    pub fn shutdown(self) -> CoreResult<()> {
        self.shutdown.store(true, Ordering::Release);
        self.thread.thread().unpark();
        self.thread
            .join()
            .map_err(|_| CoreError::Io(std::io::Error::other("worker thread panicked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeltaStrategy, EngineConfig, EntityIndexConfig, FieldSpec};
    use crate::store::TableSchema;
    use crate::types::RecordId;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn config() -> EngineConfig {
        EngineConfig::new()
            .table(TableSchema::new("articles", &["title", "delta"]))
            .entity(
                EntityIndexConfig::new("articles")
                    .field(FieldSpec::column("title"))
                    .delta(DeltaStrategy::Delayed),
            )
            .quiet(true)
            .poll_interval(Duration::from_millis(10))
    }

    fn title(text: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("title".to_string(), text.to_string())])
    }

    #[test]
    fn one_worker_per_engine() {
        let engine = Arc::new(Engine::open_in_memory(config()).unwrap());
        let first = Worker::new(Arc::clone(&engine)).unwrap();
        assert!(matches!(
            Worker::new(Arc::clone(&engine)),
            Err(CoreError::WorkerLocked)
        ));
        drop(first);
        assert!(Worker::new(engine).is_ok());
    }

    #[test]
    fn one_worker_per_directory() {
        let temp = tempdir().unwrap();
        let a = Arc::new(Engine::open(temp.path(), config()).unwrap());
        let b = Arc::new(Engine::open(temp.path(), config()).unwrap());
        let _worker = Worker::new(a).unwrap();
        assert!(matches!(Worker::new(b), Err(CoreError::WorkerLocked)));
    }

    #[test]
    fn drain_runs_queued_jobs() {
        let engine = Arc::new(Engine::open_in_memory(config()).unwrap());
        engine.insert("articles", RecordId::new(1), title("queued")).unwrap();
        let worker = Worker::new(Arc::clone(&engine)).unwrap();

        let report = worker.drain().unwrap();
        assert_eq!(report.completed.len(), 1);
        assert!(worker.drain().unwrap().completed.is_empty());
        assert_eq!(engine.search("articles", "queued").unwrap().hits.len(), 1);
    }

    #[test]
    fn spawned_worker_survives_empty_queue() {
        let engine = Arc::new(Engine::open_in_memory(config()).unwrap());
        let handle = Worker::new(Arc::clone(&engine)).unwrap().spawn().unwrap();
        thread::sleep(Duration::from_millis(50));

        engine.insert("articles", RecordId::new(7), title("later")).unwrap();
        handle.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.search("articles", "later").unwrap().is_empty() {
            assert!(Instant::now() < deadline, "worker never built the delta");
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown().unwrap();
        assert!(Worker::new(engine).is_ok());
    }
}
