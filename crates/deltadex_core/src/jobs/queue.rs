//! Durable job queue.

use super::job::{BuildJob, JobId, JobState, TriggerReason};
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::segment::SegmentKind;
use crate::types::Timestamp;
use deltadex_storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A queue change as stored in the job journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum JobEntry {
    /// First entry of a compacted journal.
    Watermark { next_id: u64 },
    Enqueued(BuildJob),
    Started { id: JobId, at: Timestamp },
    Completed { id: JobId, at: Timestamp },
    Failed { id: JobId, at: Timestamp, error: String },
    Requeued { id: JobId },
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting jobs.
    pub queued: usize,
    /// Claimed jobs.
    pub running: usize,
    /// Finished jobs still in the journal.
    pub completed: usize,
    /// Failed jobs still in the journal.
    pub failed: usize,
}

#[derive(Debug)]
struct QueueInner {
    jobs: BTreeMap<JobId, BuildJob>,
    next_id: u64,
    journal: Option<Journal>,
}

impl QueueInner {
    fn apply(&mut self, entry: JobEntry) {
        match entry {
            JobEntry::Watermark { next_id } => self.next_id = self.next_id.max(next_id),
            JobEntry::Enqueued(job) => {
                self.next_id = self.next_id.max(job.id.as_u64() + 1);
                self.jobs.insert(job.id, job);
            }
            JobEntry::Started { id, at } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Running;
                    job.attempts += 1;
                    job.started_at = Some(at);
                }
            }
            JobEntry::Completed { id, at } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Completed;
                    job.finished_at = Some(at);
                }
            }
            JobEntry::Failed { id, at, error } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Failed { error };
                    job.finished_at = Some(at);
                }
            }
            JobEntry::Requeued { id } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Queued;
                    job.started_at = None;
                }
            }
        }
    }

    fn append(&mut self, entry: JobEntry) -> CoreResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(std::slice::from_ref(&entry))?;
        }
        self.apply(entry);
        Ok(())
    }

    fn job_mut(&mut self, id: JobId) -> CoreResult<&mut BuildJob> {
        self.jobs.get_mut(&id).ok_or(CoreError::JobNotFound { id })
    }

    fn finished(&self) -> usize {
        self.jobs.values().filter(|j| j.state.is_terminal()).count()
    }
}

/// Build jobs with a journal.
///
/// Every transition is journaled before it is applied. Callers that share
/// the journal with other processes must hold the directory lock and call
/// [`JobQueue::refresh`] before changing the queue.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    compact_after: usize,
}

impl JobQueue {
    /// Creates a queue that is not persisted.
    ///
    /// Finished jobs are dropped once more than `compact_after` of them
    /// have piled up.
    #[must_use]
    pub fn in_memory(compact_after: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: BTreeMap::new(),
                next_id: 1,
                journal: None,
            }),
            compact_after: compact_after.max(1),
        }
    }

    /// Opens a queue over a backend, replaying its journal.
    ///
    /// `compact_after` is the number of finished jobs that triggers a
    /// journal rewrite.
    pub fn open(backend: Box<dyn StorageBackend>, compact_after: usize) -> CoreResult<Self> {
        let queue = Self {
            inner: Mutex::new(QueueInner {
                jobs: BTreeMap::new(),
                next_id: 1,
                journal: Some(Journal::new(backend)),
            }),
            compact_after: compact_after.max(1),
        };
        let replayed = queue.refresh()?;
        debug!(entries = replayed, "job journal replayed");
        Ok(queue)
    }

    /// Applies journal entries written by other processes.
    ///
    /// If the journal was compacted elsewhere, the queue is rebuilt from the
    /// new journal. Returns the number of entries applied.
    pub fn refresh(&self) -> CoreResult<usize> {
        let mut inner = self.inner.lock();
        let Some(journal) = inner.journal.as_mut() else {
            return Ok(0);
        };
        let truncated = journal.is_truncated()?;
        if truncated {
            journal.reset();
        }
        let entries: Vec<JobEntry> = journal.read_new()?;
        if truncated {
            inner.jobs.clear();
        }
        let count = entries.len();
        for entry in entries {
            inner.apply(entry);
        }
        Ok(count)
    }

    /// Applies pending entries, then drops a torn journal tail.
    ///
    /// Call under the directory lock. Returns the bytes removed.
    pub fn repair_tail(&self) -> CoreResult<u64> {
        self.refresh()?;
        match self.inner.lock().journal.as_mut() {
            Some(journal) => journal.truncate_torn_tail(),
            None => Ok(0),
        }
    }

    /// Enqueues a job, or returns the queued job for the same entity and
    /// target.
    ///
    /// Returns the job ID and whether a new job was created.
    pub fn enqueue(
        &self,
        entity: &str,
        target: SegmentKind,
        reason: TriggerReason,
        now: Timestamp,
    ) -> CoreResult<(JobId, bool)> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.jobs.values().find(|j| {
            j.state == JobState::Queued && j.entity == entity && j.target == target
        }) {
            debug!(job = %existing.id, entity, %target, "coalesced onto queued job");
            return Ok((existing.id, false));
        }

        let id = JobId::new(inner.next_id);
        let job = BuildJob::new(id, entity, target, reason, now);
        inner.append(JobEntry::Enqueued(job))?;
        debug!(job = %id, entity, %target, %reason, "job enqueued");
        Ok((id, true))
    }

    /// Claims the oldest queued job whose target is not already running.
    pub fn claim_next(&self, now: Timestamp) -> CoreResult<Option<BuildJob>> {
        let mut inner = self.inner.lock();
        let running: Vec<(String, SegmentKind)> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .map(|j| (j.entity.clone(), j.target))
            .collect();
        let Some(id) = inner
            .jobs
            .values()
            .find(|j| {
                j.state == JobState::Queued
                    && !running
                        .iter()
                        .any(|(entity, target)| *entity == j.entity && *target == j.target)
            })
            .map(|j| j.id)
        else {
            return Ok(None);
        };

        inner.job_mut(id)?.clone().transition(JobState::Running, now)?;
        inner.append(JobEntry::Started { id, at: now })?;
        Ok(inner.jobs.get(&id).cloned())
    }

    /// Marks a running job completed.
    pub fn complete(&self, id: JobId, now: Timestamp) -> CoreResult<()> {
        self.finish(id, JobState::Completed, now)
    }

    /// Marks a running job failed.
    pub fn fail(&self, id: JobId, error: impl Into<String>, now: Timestamp) -> CoreResult<()> {
        self.finish(
            id,
            JobState::Failed {
                error: error.into(),
            },
            now,
        )
    }

    fn finish(&self, id: JobId, state: JobState, now: Timestamp) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        // Validate on a copy so a rejected transition changes nothing.
        inner.job_mut(id)?.clone().transition(state.clone(), now)?;
        let entry = match state {
            JobState::Failed { error } => JobEntry::Failed { id, at: now, error },
            _ => JobEntry::Completed { id, at: now },
        };
        inner.append(entry)?;

        if inner.finished() > self.compact_after {
            Self::compact(&mut inner)?;
        }
        Ok(())
    }

    /// Returns a running job to the queue.
    ///
    /// The job is Queued in this handle even when the journal write fails.
    /// The journal then still shows it Running, and the next
    /// [`JobQueue::recover_abandoned`] requeues it there.
    pub fn requeue(&self, id: JobId, now: Timestamp) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.job_mut(id)?.clone().transition(JobState::Queued, now)?;
        let entry = JobEntry::Requeued { id };
        let written = inner.append(entry.clone());
        if written.is_err() {
            inner.apply(entry);
        }
        written
    }

    /// Returns a running job to the queue of this handle only.
    ///
    /// For callers that cannot take the directory lock to journal the change.
    pub fn requeue_local(&self, id: JobId, now: Timestamp) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.job_mut(id)?.clone().transition(JobState::Queued, now)?;
        inner.apply(JobEntry::Requeued { id });
        Ok(())
    }

    /// Returns jobs left Running by a dead worker to the queue.
    pub fn recover_abandoned(&self) -> CoreResult<Vec<JobId>> {
        let mut inner = self.inner.lock();
        let running: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .map(|j| j.id)
            .collect();
        for id in &running {
            inner.append(JobEntry::Requeued { id: *id })?;
        }
        if !running.is_empty() {
            info!(count = running.len(), "requeued abandoned jobs");
        }
        Ok(running)
    }

    /// Rewrites the journal with only the live jobs.
    fn compact(inner: &mut QueueInner) -> CoreResult<()> {
        let dropped = inner.finished();
        inner.jobs.retain(|_, job| !job.state.is_terminal());

        let mut entries = vec![JobEntry::Watermark {
            next_id: inner.next_id,
        }];
        let mut replay = Vec::new();
        for job in inner.jobs.values() {
            let mut queued = job.clone();
            queued.state = JobState::Queued;
            if job.state == JobState::Running {
                queued.attempts = queued.attempts.saturating_sub(1);
                entries.push(JobEntry::Enqueued(queued));
                replay.push(JobEntry::Started {
                    id: job.id,
                    at: job.started_at.unwrap_or(job.enqueued_at),
                });
            } else {
                entries.push(JobEntry::Enqueued(queued));
            }
        }
        entries.extend(replay);

        if let Some(journal) = inner.journal.as_mut() {
            journal.rewrite(&entries)?;
        }
        info!(dropped, live = inner.jobs.len(), "job journal compacted");
        Ok(())
    }

    /// Returns a job.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<BuildJob> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    /// Returns all jobs in ID order.
    #[must_use]
    pub fn jobs(&self) -> Vec<BuildJob> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    /// Returns failed jobs in ID order.
    #[must_use]
    pub fn failed(&self) -> Vec<BuildJob> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Failed { .. }))
            .cloned()
            .collect()
    }

    /// Returns job counts by state.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed { .. } => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltadex_storage::InMemoryBackend;

    const T: Timestamp = Timestamp::from_millis(1);

    fn enqueue(queue: &JobQueue, entity: &str, target: SegmentKind) -> (JobId, bool) {
        queue
            .enqueue(entity, target, TriggerReason::Mutation, T)
            .unwrap()
    }

    #[test]
    fn enqueue_coalesces_queued_jobs() {
        let queue = JobQueue::in_memory(100);
        let (a, created) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert!(created);
        assert_eq!(enqueue(&queue, "articles", SegmentKind::Delta), (a, false));

        let (b, created) = enqueue(&queue, "articles", SegmentKind::Core);
        assert!(created);
        assert_ne!(a, b);
        assert_eq!(queue.stats().queued, 2);
    }

    #[test]
    fn running_job_does_not_absorb_new_work() {
        let queue = JobQueue::in_memory(100);
        let (a, _) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert_eq!(queue.claim_next(T).unwrap().unwrap().id, a);

        let (b, created) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert!(created);
        // Same target is still running.
        assert!(queue.claim_next(T).unwrap().is_none());

        queue.complete(a, T).unwrap();
        assert_eq!(queue.claim_next(T).unwrap().unwrap().id, b);
    }

    #[test]
    fn finishing_requires_running() {
        let queue = JobQueue::in_memory(100);
        let (id, _) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert!(matches!(
            queue.complete(id, T),
            Err(CoreError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.complete(JobId::new(99), T),
            Err(CoreError::JobNotFound { .. })
        ));

        queue.claim_next(T).unwrap();
        queue.fail(id, "indexer crashed", T).unwrap();
        let job = queue.get(id).unwrap();
        assert_eq!(
            job.state,
            JobState::Failed {
                error: "indexer crashed".into()
            }
        );
        assert_eq!(queue.failed().len(), 1);
    }

    #[test]
    fn jobs_survive_reopen_and_running_jobs_recover() {
        let backend = InMemoryBackend::new();
        let (queued, running) = {
            let queue = JobQueue::open(Box::new(backend.clone()), 100).unwrap();
            let (running, _) = enqueue(&queue, "articles", SegmentKind::Delta);
            queue.claim_next(T).unwrap();
            let (queued, _) = enqueue(&queue, "comments", SegmentKind::Delta);
            (queued, running)
        };

        let queue = JobQueue::open(Box::new(backend), 100).unwrap();
        assert_eq!(queue.get(running).unwrap().state, JobState::Running);
        assert_eq!(queue.get(queued).unwrap().state, JobState::Queued);

        assert_eq!(queue.recover_abandoned().unwrap(), vec![running]);
        let stats = queue.stats();
        assert_eq!((stats.queued, stats.running), (2, 0));
    }

    #[test]
    fn compaction_drops_finished_jobs() {
        let backend = InMemoryBackend::new();
        let queue = JobQueue::open(Box::new(backend.clone()), 2).unwrap();
        for _ in 0..3 {
            let (id, _) = enqueue(&queue, "articles", SegmentKind::Delta);
            queue.claim_next(T).unwrap();
            queue.complete(id, T).unwrap();
        }
        let (live, _) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert_eq!(queue.stats().completed, 0);

        let reopened = JobQueue::open(Box::new(backend), 2).unwrap();
        assert_eq!(reopened.jobs().len(), 1);
        assert_eq!(reopened.get(live).unwrap().state, JobState::Queued);
        let (next, _) = reopened
            .enqueue("articles", SegmentKind::Core, TriggerReason::Operator, T)
            .unwrap();
        assert!(next > live);
    }

    #[test]
    fn refresh_follows_foreign_compaction() {
        let backend = InMemoryBackend::new();
        let writer = JobQueue::open(Box::new(backend.clone()), 1).unwrap();
        let reader = JobQueue::open(Box::new(backend), 1).unwrap();

        for _ in 0..2 {
            let (id, _) = enqueue(&writer, "articles", SegmentKind::Delta);
            writer.claim_next(T).unwrap();
            writer.complete(id, T).unwrap();
            reader.refresh().unwrap();
        }
        let (live, _) = enqueue(&writer, "articles", SegmentKind::Core);

        reader.refresh().unwrap();
        assert_eq!(reader.jobs().len(), 1);
        assert_eq!(reader.get(live).unwrap().target, SegmentKind::Core);
    }

    #[test]
    fn in_memory_queue_drops_finished_jobs() {
        let queue = JobQueue::in_memory(10);
        for _ in 0..500 {
            let (id, _) = enqueue(&queue, "articles", SegmentKind::Delta);
            queue.claim_next(T).unwrap();
            queue.complete(id, T).unwrap();
        }
        assert!(queue.jobs().len() <= 10);

        let (next, created) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert!(created);
        assert_eq!(next, JobId::new(501));
    }

    #[test]
    fn requeued_job_can_be_claimed_again() {
        let backend = InMemoryBackend::new();
        let queue = JobQueue::open(Box::new(backend.clone()), 100).unwrap();
        let (id, _) = enqueue(&queue, "articles", SegmentKind::Delta);
        assert!(matches!(
            queue.requeue(id, T),
            Err(CoreError::InvalidStateTransition { .. })
        ));

        queue.claim_next(T).unwrap();
        queue.requeue(id, T).unwrap();
        let reopened = JobQueue::open(Box::new(backend), 100).unwrap();
        assert_eq!(reopened.get(id).unwrap().state, JobState::Queued);

        let again = queue.claim_next(T).unwrap().unwrap();
        assert_eq!((again.id, again.attempts), (id, 2));
    }

    #[test]
    fn local_requeue_leaves_journal_for_recovery() {
        let backend = InMemoryBackend::new();
        let queue = JobQueue::open(Box::new(backend.clone()), 100).unwrap();
        let (id, _) = enqueue(&queue, "articles", SegmentKind::Delta);
        queue.claim_next(T).unwrap();
        queue.requeue_local(id, T).unwrap();
        assert_eq!(queue.get(id).unwrap().state, JobState::Queued);

        let reopened = JobQueue::open(Box::new(backend), 100).unwrap();
        assert_eq!(reopened.recover_abandoned().unwrap(), vec![id]);
    }
}
