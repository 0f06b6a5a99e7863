//! Restart, crash and multi-process behavior of a persisted index.

use deltadex_core::{
    BuildOutput, BuildRequest, Clock, CoreError, CoreResult, DeltaStrategy, Engine, Indexer,
    JobState, NativeIndexer, RecordId, SegmentKind, TriggerReason, Worker,
};
use deltadex_storage::InMemoryBackend;
use deltadex_testkit::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn ids(engine: &Engine, query: &str) -> Vec<u64> {
    engine
        .search(ARTICLES, query)
        .unwrap()
        .ids()
        .into_iter()
        .map(RecordId::as_u64)
        .collect()
}

#[test]
fn restart_serves_both_segments() {
    let t = TestEngine::file(DeltaStrategy::Immediate);
    t.insert_article(1, "archived", "");
    t.rebuild_core(ARTICLES).unwrap();
    t.insert_article(2, "fresh", "");

    let reopened = t.open_again();
    assert_eq!(ids(&reopened, "archived"), vec![1]);
    assert_eq!(ids(&reopened, "fresh"), vec![2]);
    assert!(reopened.get(ARTICLES, RecordId::new(2)).unwrap().is_dirty());
    assert!(!reopened.get(ARTICLES, RecordId::new(1)).unwrap().is_dirty());
}

#[test]
fn second_handle_sees_mutations_and_segments() {
    let t = TestEngine::file(DeltaStrategy::Immediate);
    let other = t.open_again();

    t.insert_article(1, "shared", "");
    other.refresh().unwrap();
    assert_eq!(ids(&other, "shared"), vec![1]);

    other
        .insert(ARTICLES, RecordId::new(2), columns(&[("title", "reply")]))
        .unwrap();
    t.refresh().unwrap();
    assert_eq!(t.search_ids("reply"), vec![2]);
    assert_eq!(t.store().sequence(), other.store().sequence());
}

#[test]
fn interleaved_writers_do_not_conflict() {
    let t = TestEngine::file(DeltaStrategy::Delayed);
    let other = t.open_again();
    for id in 0..10u64 {
        let writer: &Engine = if id % 2 == 0 { &t } else { &other };
        writer
            .insert(ARTICLES, RecordId::new(id), columns(&[("title", "alternating")]))
            .unwrap();
    }
    t.refresh().unwrap();
    assert_eq!(t.store().len(ARTICLES), 10);
    assert_eq!(t.queue().stats().queued, 1);
}

#[test]
fn corrupt_core_segment_degrades_search() {
    let t = TestEngine::file(DeltaStrategy::Immediate);
    t.insert_article(1, "core", "");
    t.rebuild_core(ARTICLES).unwrap();
    t.insert_article(2, "delta", "");
    corrupt_segment(t.dir().unwrap(), ARTICLES, SegmentKind::Core).unwrap();

    let reopened = t.open_again();
    let result = reopened.search(ARTICLES, "delta").unwrap();
    assert_eq!(result.ids(), vec![RecordId::new(2)]);
    assert!(result.degraded.is_some());
    assert_eq!(reopened.status().unwrap().entities[0].core.state, "unavailable");

    corrupt_segment(t.dir().unwrap(), ARTICLES, SegmentKind::Delta).unwrap();
    let broken = t.open_again();
    assert!(matches!(
        broken.search(ARTICLES, "delta"),
        Err(CoreError::SegmentUnavailable { .. })
    ));

    broken.rebuild_core(ARTICLES).unwrap();
    let healed = broken.search(ARTICLES, "core delta").unwrap();
    assert!(healed.degraded.is_none());
}

#[test]
fn torn_record_log_is_repaired_on_open() {
    let records = InMemoryBackend::new();
    let jobs = InMemoryBackend::new();
    let config = blog_config(DeltaStrategy::Delayed);
    {
        let engine = Engine::builder(config.clone())
            .backends(
                Box::new(records.clone()),
                Box::new(jobs.clone()),
            )
            .build()
            .unwrap();
        engine
            .insert(ARTICLES, RecordId::new(1), columns(&[("title", "kept")]))
            .unwrap();
    }

    let budget = 5;
    {
        let torn = TornBackend::new(records.clone(), budget);
        let engine = Engine::builder(config.clone())
            .backends(Box::new(torn), Box::new(jobs.clone()))
            .build()
            .unwrap();
        assert!(engine
            .insert(ARTICLES, RecordId::new(2), columns(&[("title", "lost")]))
            .is_err());
    }

    let engine = Engine::builder(config)
        .backends(Box::new(records), Box::new(jobs))
        .build()
        .unwrap();
    assert!(engine.get(ARTICLES, RecordId::new(1)).is_some());
    assert!(engine.get(ARTICLES, RecordId::new(2)).is_none());
    engine
        .insert(ARTICLES, RecordId::new(3), columns(&[("title", "after")]))
        .unwrap();
    engine.build_delta(ARTICLES).unwrap();
    assert_eq!(ids(&engine, "after"), vec![3]);
}

#[test]
fn abandoned_running_job_is_requeued() {
    let t = TestEngine::file(DeltaStrategy::Delayed);
    t.insert_article(1, "orphan", "");
    let claimed = t.queue().claim_next(t.clock().now()).unwrap().unwrap();
    assert!(matches!(claimed.state, JobState::Running));

    let restarted = t.open_again();
    let worker = Worker::new(Arc::clone(&restarted)).unwrap();
    let report = worker.drain().unwrap();
    assert_eq!(report.completed, vec![claimed.id]);
    assert_eq!(ids(&restarted, "orphan"), vec![1]);
}

#[test]
fn operator_rebuild_job_runs_core_build() {
    let t = TestEngine::memory(DeltaStrategy::Delayed);
    t.insert_article(1, "operator", "");
    let job = t
        .enqueue_build(ARTICLES, SegmentKind::Core, TriggerReason::Operator)
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some(outcome) = t.run_next_job().unwrap() {
        outcomes.push(outcome);
    }
    assert!(outcomes.iter().any(|o| o.job.id == job && o.error.is_none()));
    assert!(!t.is_dirty(1));
    assert_eq!(
        t.search("operator").hits[0].source,
        SegmentKind::Core
    );
}

#[test]
fn failed_jobs_can_be_retried() {
    let indexer = FailingIndexer::new();
    let t = TestEngine::with_indexer(DeltaStrategy::Delayed, indexer.clone());
    t.insert_article(1, "retry", "");

    indexer.set_failing(true);
    let outcome = t.run_next_job().unwrap().unwrap();
    assert!(outcome.error.is_some());
    assert_eq!(t.queue().stats().failed, 1);

    indexer.set_failing(false);
    let retried = t.retry_failed().unwrap();
    assert_eq!(retried.len(), 1);
    let outcome = t.run_next_job().unwrap().unwrap();
    assert_eq!(outcome.job.reason, TriggerReason::Retry);
    assert!(outcome.error.is_none());
    assert_eq!(t.search_ids("retry"), vec![1]);
}

#[test]
fn record_log_error_during_a_job_fails_that_job_only() {
    let records = FlakyBackend::default();
    let engine = Engine::builder(blog_config(DeltaStrategy::Delayed))
        .backends(Box::new(records.clone()), Box::new(InMemoryBackend::new()))
        .build()
        .unwrap();
    engine
        .insert(ARTICLES, RecordId::new(1), columns(&[("title", "alpha")]))
        .unwrap();

    records.fail_next_refreshes(1);
    let outcome = engine.run_next_job().unwrap().unwrap();
    assert!(outcome.error.is_some());
    assert!(matches!(outcome.job.state, JobState::Failed { .. }));
    assert_eq!(engine.queue().stats().running, 0);

    engine
        .insert(ARTICLES, RecordId::new(2), columns(&[("title", "beta")]))
        .unwrap();
    let outcome = engine.run_next_job().unwrap().unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(ids(&engine, "alpha"), vec![1]);
    assert_eq!(ids(&engine, "beta"), vec![2]);
}

/// Indexer that breaks the job journal once, in the middle of a build.
#[derive(Debug)]
struct JournalBreakingIndexer {
    jobs: FlakyBackend,
    armed: AtomicBool,
}

impl Indexer for JournalBreakingIndexer {
    fn build(&self, request: BuildRequest<'_>) -> CoreResult<BuildOutput> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.jobs.fail_next_refreshes(1);
        }
        NativeIndexer.build(request)
    }
}

#[test]
fn job_whose_outcome_cannot_be_recorded_is_requeued() {
    let jobs = FlakyBackend::default();
    let engine = Engine::builder(blog_config(DeltaStrategy::Delayed))
        .backends(Box::new(InMemoryBackend::new()), Box::new(jobs.clone()))
        .indexer(Arc::new(JournalBreakingIndexer {
            jobs,
            armed: AtomicBool::new(true),
        }))
        .build()
        .unwrap();
    engine
        .insert(ARTICLES, RecordId::new(1), columns(&[("title", "gamma")]))
        .unwrap();

    assert!(engine.run_next_job().is_err());
    let stats = engine.queue().stats();
    assert_eq!((stats.queued, stats.running), (1, 0));

    let outcome = engine.run_next_job().unwrap().unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.job.attempts, 2);
    assert!(engine.run_next_job().unwrap().is_none());
    assert_eq!(ids(&engine, "gamma"), vec![1]);
}
