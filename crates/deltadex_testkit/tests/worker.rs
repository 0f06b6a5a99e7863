//! Background worker behavior.

use deltadex_core::{CoreError, DeltaStrategy, Worker};
use deltadex_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn worker_drains_jobs_enqueued_by_another_handle() {
    let t = TestEngine::file(DeltaStrategy::Delayed);
    let worker_engine = t.open_again();
    let handle = Worker::new(Arc::clone(&worker_engine))
        .unwrap()
        .spawn()
        .unwrap();

    t.insert_article(1, "handoff", "");
    handle.wake();
    wait_for(|| {
        t.refresh().unwrap();
        t.queue().stats().completed == 1
    });
    handle.shutdown().unwrap();
    assert_eq!(t.search_ids("handoff"), vec![1]);
}

#[test]
fn worker_polls_datetime_thresholds() {
    let t = TestEngine::memory(DeltaStrategy::Datetime {
        threshold: Duration::from_secs(60),
    });
    let worker = Worker::new(Arc::clone(&t.engine)).unwrap();

    t.insert_article(1, "settled", "");
    assert_eq!(worker.tick().unwrap().total(), 0);
    assert!(t.search_ids("settled").is_empty());

    t.clock.advance(Duration::from_secs(60));
    let report = worker.tick().unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(t.search_ids("settled"), vec![1]);
    assert_eq!(worker.tick().unwrap().total(), 0);
}

#[test]
fn only_one_worker_per_directory() {
    let t = TestEngine::file(DeltaStrategy::Delayed);
    let _first = Worker::new(Arc::clone(&t.engine)).unwrap();
    assert!(matches!(
        Worker::new(t.open_again()),
        Err(CoreError::WorkerLocked)
    ));
}

#[test]
fn failing_build_does_not_stop_the_worker() {
    let indexer = FailingIndexer::new();
    let t = TestEngine::with_indexer(DeltaStrategy::Delayed, indexer.clone());
    let worker = Worker::new(Arc::clone(&t.engine)).unwrap();

    indexer.set_failing(true);
    t.insert_article(1, "doomed", "");
    let report = worker.drain().unwrap();
    assert_eq!(report.failed.len(), 1);

    indexer.set_failing(false);
    t.insert_article(2, "lucky", "");
    let report = worker.drain().unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(t.search_ids("doomed"), vec![1]);
    assert_eq!(t.search_ids("lucky"), vec![2]);
}
