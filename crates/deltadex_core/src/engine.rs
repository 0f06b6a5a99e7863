//! The engine facade.
//!
//! [`Engine`] owns the record store, the served segments and the job queue,
//! and routes every mutation through the change tracker:
//!
//! 1. Under the log gate: catch up with the logs, apply the mutation, touch
//!    association owners, enqueue jobs for delayed entities.
//! 2. Outside the gate: run inline delta builds for immediate entities.
//!
//! A mutation is committed once step 1 returns. A failed inline build is
//! reported in the [`MutationReport`] and leaves the served delta as it was.

use crate::clock::{Clock, SystemClock};
use crate::config::{BuildOptions, DeltaStrategy, EngineConfig, EntityIndexConfig};
use crate::delta::{self, DeltaBuild};
use crate::dir::{IndexDir, LogGate, WorkerLease};
use crate::error::{CoreError, CoreResult};
use crate::index_store::{IndexStore, SegmentSlot};
use crate::indexer::{BuildContext, Indexer, NativeIndexer};
use crate::jobs::{BuildJob, JobId, JobQueue, JobState, QueueStats, TriggerReason};
use crate::merger::{self, SearchResult};
use crate::query::Query;
use crate::rebuild::{self, RebuildReport};
use crate::segment::SegmentKind;
use crate::store::{Record, RecordStore, TableSchema};
use crate::tracker::{ChangeTracker, DeltaAction};
use crate::types::{Generation, RecordId, SequenceNumber, Timestamp};
use deltadex_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// Mutated table.
    pub table: String,
    /// Mutated record.
    pub id: RecordId,
    /// Revision assigned by the mutation.
    pub revision: SequenceNumber,
    /// Whether the record carries a dirty marker afterwards.
    pub dirty: bool,
    /// Owner records touched through association fields.
    pub propagated: Vec<(String, RecordId)>,
    /// Inline delta builds that ran.
    pub built: Vec<(String, DeltaBuild)>,
    /// Jobs enqueued (or coalesced onto).
    pub enqueued: Vec<JobId>,
    /// Inline builds that failed.
    pub build_errors: Vec<String>,
}

/// Result of running one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The job in its final state.
    pub job: BuildJob,
    /// Error message if the job failed.
    pub error: Option<String>,
}

/// State of one segment slot, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// `empty`, `ready` or `unavailable`.
    pub state: &'static str,
    /// Generation being served.
    pub generation: Option<Generation>,
    /// Stored documents.
    pub documents: usize,
    /// Kill entries.
    pub kills: usize,
    /// Build time of the served segment.
    pub built_at: Option<Timestamp>,
    /// Why the slot is unavailable.
    pub error: Option<String>,
}

impl From<&SegmentSlot> for SlotStatus {
    fn from(slot: &SegmentSlot) -> Self {
        let segment = slot.segment();
        Self {
            state: slot.label(),
            generation: segment.map(|s| s.generation()),
            documents: segment.map_or(0, |s| s.len()),
            kills: segment.map_or(0, |s| s.kills().count()),
            built_at: segment.map(|s| s.built_at()),
            error: match slot {
                SegmentSlot::Unavailable(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

/// Status of one indexed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityStatus {
    /// Entity name.
    pub name: String,
    /// Delta strategy label.
    pub strategy: &'static str,
    /// Live records.
    pub records: usize,
    /// Dirty records and tombstones.
    pub dirty: usize,
    /// Core slot.
    pub core: SlotStatus,
    /// Delta slot.
    pub delta: SlotStatus,
}

/// Engine-wide status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Latest record sequence.
    pub sequence: SequenceNumber,
    /// Enabled entities.
    pub entities: Vec<EntityStatus>,
    /// Disabled entities and why.
    pub disabled: BTreeMap<String, String>,
    /// Job counts.
    pub jobs: QueueStats,
}

/// Builder for [`Engine`].
#[must_use]
pub struct EngineBuilder {
    config: EngineConfig,
    path: Option<PathBuf>,
    backends: Option<(Box<dyn StorageBackend>, Box<dyn StorageBackend>)>,
    indexer: Arc<dyn Indexer>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    /// Persists everything in a directory.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Uses the given backends for the record log and the job journal.
    ///
    /// Segments stay in memory. Ignored when a path is set.
    pub fn backends(
        mut self,
        records: Box<dyn StorageBackend>,
        jobs: Box<dyn StorageBackend>,
    ) -> Self {
        self.backends = Some((records, jobs));
        self
    }

    /// Replaces the indexer.
    pub fn indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = indexer;
        self
    }

    /// Replaces the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the engine.
    ///
    /// Entities whose configuration does not validate are disabled and
    /// logged; they do not fail the open.
    pub fn build(self) -> CoreResult<Engine> {
        let dir = self.path.as_deref().map(IndexDir::open).transpose()?;
        let backends = match &dir {
            Some(dir) => Some((
                Box::new(FileBackend::open(&dir.records_path())?) as Box<dyn StorageBackend>,
                Box::new(FileBackend::open(&dir.jobs_path())?) as Box<dyn StorageBackend>,
            )),
            None => self.backends,
        };

        let (store, queue) = match backends {
            Some((records, jobs)) => (
                RecordStore::open(records)?,
                JobQueue::open(jobs, self.config.compact_journal_after)?,
            ),
            None => (
                RecordStore::new(),
                JobQueue::in_memory(self.config.compact_journal_after),
            ),
        };

        let gate = LogGate::new(dir.clone());
        {
            let _gate = gate.hold()?;
            let torn = store.repair_tail()? + queue.repair_tail()?;
            if torn > 0 {
                warn!(bytes = torn, "dropped torn log tail left by a crashed writer");
            }
            for schema in &self.config.tables {
                if store.ensure_table(schema)? {
                    debug!(table = %schema.name, "table schema updated");
                }
            }
        }

        let mut entities = BTreeMap::new();
        let mut disabled = BTreeMap::new();
        for entity in &self.config.entities {
            let verdict = if entities.contains_key(&entity.name) {
                Err(CoreError::invalid_config(&entity.name, "entity declared twice"))
            } else {
                entity.validate(&store)
            };
            match verdict {
                Ok(()) => {
                    entities.insert(entity.name.clone(), entity.clone());
                }
                Err(e) => {
                    warn!(entity = %entity.name, error = %e, "indexing disabled for entity");
                    disabled.insert(entity.name.clone(), e.to_string());
                }
            }
        }

        let index = match &dir {
            Some(dir) => IndexStore::persistent(dir.clone()),
            None => IndexStore::in_memory(),
        };
        for name in entities.keys() {
            index.register(name)?;
        }
        let tracker = ChangeTracker::new(entities.values());

        info!(
            path = ?self.path,
            entities = entities.len(),
            disabled = disabled.len(),
            "engine opened"
        );
        Ok(Engine {
            config: self.config,
            dir,
            store,
            index,
            queue,
            tracker,
            entities,
            disabled,
            indexer: self.indexer,
            clock: self.clock,
            gate,
            worker_active: AtomicBool::new(false),
        })
    }
}

struct Change {
    id: RecordId,
    old: Option<Record>,
    new: Option<Record>,
}

/// The delta indexing engine.
pub struct Engine {
    config: EngineConfig,
    dir: Option<IndexDir>,
    store: RecordStore,
    index: IndexStore,
    queue: JobQueue,
    tracker: ChangeTracker,
    entities: BTreeMap<String, EntityIndexConfig>,
    disabled: BTreeMap<String, String>,
    indexer: Arc<dyn Indexer>,
    clock: Arc<dyn Clock>,
    gate: LogGate,
    worker_active: AtomicBool,
}

impl Engine {
    /// Starts building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            path: None,
            backends: None,
            indexer: Arc::new(NativeIndexer),
            clock: Arc::new(SystemClock),
        }
    }

    /// Opens an engine that keeps everything in memory.
    pub fn open_in_memory(config: EngineConfig) -> CoreResult<Self> {
        Self::builder(config).build()
    }

    /// Opens (or creates) an engine in a directory.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> CoreResult<Self> {
        Self::builder(config).path(path).build()
    }

    fn ctx(&self) -> BuildContext<'_> {
        BuildContext {
            store: &self.store,
            index: &self.index,
            indexer: self.indexer.as_ref(),
            clock: self.clock.as_ref(),
            gate: &self.gate,
        }
    }

    /// Returns the configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the directory, for persistent engines.
    #[must_use]
    pub fn dir(&self) -> Option<&IndexDir> {
        self.dir.as_ref()
    }

    /// Returns the clock.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Returns the record store for reads.
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Returns the job queue for reads.
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Entities disabled at open, with the configuration error.
    #[must_use]
    pub fn disabled_entities(&self) -> &BTreeMap<String, String> {
        &self.disabled
    }

    /// Enabled entities.
    pub fn entities(&self) -> impl Iterator<Item = &EntityIndexConfig> {
        self.entities.values()
    }

    /// Returns an enabled entity's configuration.
    ///
    /// # Errors
    ///
    /// [`CoreError::EntityDisabled`] for an entity disabled at open,
    /// [`CoreError::UnknownEntity`] for one that was never declared.
    pub fn entity(&self, name: &str) -> CoreResult<&EntityIndexConfig> {
        if let Some(entity) = self.entities.get(name) {
            return Ok(entity);
        }
        match self.disabled.get(name) {
            Some(reason) => Err(CoreError::EntityDisabled {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(CoreError::unknown_entity(name)),
        }
    }

    /// Returns a record.
    #[must_use]
    pub fn get(&self, table: &str, id: RecordId) -> Option<Record> {
        self.store.get(table, id)
    }

    /// Catches up with changes made by other processes: record log, job
    /// journal and segment files.
    pub fn refresh(&self) -> CoreResult<()> {
        let records = self.store.refresh()?;
        let jobs = self.queue.refresh()?;
        let segments = self.index.refresh()?;
        if records + jobs + segments > 0 {
            debug!(records, jobs, segments, "caught up with other processes");
        }
        Ok(())
    }

    /// Creates a table, or adds missing columns to it.
    pub fn create_table(&self, schema: &TableSchema) -> CoreResult<bool> {
        let _gate = self.gate.hold()?;
        self.store.refresh()?;
        self.store.ensure_table(schema)
    }

    /// Adds a column to a table.
    ///
    /// This is the migration that adds a missing dirty column. Entities
    /// disabled at open are re-validated on the next open.
    pub fn add_column(&self, table: &str, column: &str) -> CoreResult<bool> {
        let _gate = self.gate.hold()?;
        self.store.refresh()?;
        let added = self.store.add_column(table, column)?;
        if added {
            info!(table, column, "column added");
        }
        Ok(added)
    }

    /// Inserts a record.
    pub fn insert(
        &self,
        table: &str,
        id: RecordId,
        columns: BTreeMap<String, String>,
    ) -> CoreResult<MutationReport> {
        self.apply(table, |mark| {
            let record = self.store.insert(table, id, columns, mark)?;
            Ok(Change {
                id,
                old: None,
                new: Some(record),
            })
        })
    }

    /// Updates columns of a record.
    pub fn update(
        &self,
        table: &str,
        id: RecordId,
        changes: BTreeMap<String, String>,
    ) -> CoreResult<MutationReport> {
        self.apply(table, |mark| {
            let (old, new) = self.store.update(table, id, changes, mark)?;
            Ok(Change {
                id,
                old: Some(old),
                new: Some(new),
            })
        })
    }

    /// Deletes a record.
    ///
    /// Records of indexed entities leave a tombstone so the delta can hide
    /// the stale core document until the next core rebuild.
    pub fn delete(&self, table: &str, id: RecordId) -> CoreResult<MutationReport> {
        let keep = self.tracker.keeps_tombstones(table);
        self.apply(table, |mark| {
            let old = self.store.delete(table, id, keep, mark)?;
            Ok(Change {
                id,
                old: Some(old),
                new: None,
            })
        })
    }

    /// Marks a record of an entity dirty without changing it.
    ///
    /// This is the explicit propagation hook for changes the engine cannot
    /// see through association fields.
    pub fn touch(&self, entity: &str, id: RecordId) -> CoreResult<MutationReport> {
        self.entity(entity)?;
        self.apply(entity, |mark| {
            if self.store.touch(entity, id, mark)?.is_none() {
                return Err(CoreError::RecordNotFound {
                    table: entity.to_string(),
                    id,
                });
            }
            Ok(Change {
                id,
                old: None,
                new: None,
            })
        })
    }

    fn apply(
        &self,
        table: &str,
        change: impl FnOnce(Option<Timestamp>) -> CoreResult<Change>,
    ) -> CoreResult<MutationReport> {
        let now = self.clock.now();
        let mark = self.tracker.mark_time(table, now);

        let (change, propagated, affected, enqueued) = {
            let _gate = self.gate.hold()?;
            self.store.refresh()?;
            self.queue.refresh()?;

            let change = change(mark)?;
            let propagated = self.propagate(table, &change, now)?;

            let mut affected = BTreeSet::new();
            if self.tracker.entity(table).is_some() {
                affected.insert(table.to_string());
            }
            affected.extend(propagated.iter().map(|(owner, _)| owner.clone()));

            let mut enqueued = Vec::new();
            for entity in &affected {
                if self.tracker.action(entity) == DeltaAction::Enqueue {
                    let (job, _) = self.queue.enqueue(
                        entity,
                        SegmentKind::Delta,
                        TriggerReason::Mutation,
                        now,
                    )?;
                    enqueued.push(job);
                }
            }
            (change, propagated, affected, enqueued)
        };

        let (revision, dirty) = match (&change.new, self.store.tombstone(table, change.id)) {
            (Some(record), _) => (record.revision, record.is_dirty()),
            (None, Some(tombstone)) => (tombstone.revision, tombstone.dirty.is_some()),
            (None, None) => match self.store.get(table, change.id) {
                Some(record) => (record.revision, record.is_dirty()),
                None => (self.store.sequence(), false),
            },
        };

        let mut report = MutationReport {
            table: table.to_string(),
            id: change.id,
            revision,
            dirty,
            propagated,
            built: Vec::new(),
            enqueued,
            build_errors: Vec::new(),
        };

        for entity in affected {
            if self.tracker.action(&entity) != DeltaAction::BuildNow {
                continue;
            }
            let Some(config) = self.entities.get(&entity) else {
                continue;
            };
            match delta::build_delta(self.ctx(), config, &self.config.build) {
                Ok(outcome) => report.built.push((entity, outcome)),
                Err(e) => report.build_errors.push(e.to_string()),
            }
        }

        debug!(
            table,
            id = %report.id,
            revision = %report.revision,
            dirty = report.dirty,
            propagated = report.propagated.len(),
            "mutation applied"
        );
        Ok(report)
    }

    /// Touches the owners of a changed association row. Called under the
    /// gate.
    fn propagate(
        &self,
        table: &str,
        change: &Change,
        now: Timestamp,
    ) -> CoreResult<Vec<(String, RecordId)>> {
        let owners = self
            .tracker
            .owners_affected(table, change.old.as_ref(), change.new.as_ref());
        let mut touched = Vec::with_capacity(owners.len());
        for (owner, id) in owners {
            let mark = self.tracker.mark_time(&owner, now);
            match self.store.touch(&owner, id, mark)? {
                Some(newly_marked) => {
                    debug!(owner = %owner, %id, newly_marked, "owner touched by association change");
                    touched.push((owner, id));
                }
                None => debug!(owner = %owner, %id, "association points at a missing owner"),
            }
        }
        Ok(touched)
    }

    /// Runs a search against an entity.
    pub fn search(&self, entity: &str, query: &str) -> CoreResult<SearchResult> {
        let query = Query::parse(query)?;
        self.search_query(entity, &query)
    }

    /// Runs a parsed query against an entity.
    pub fn search_query(&self, entity: &str, query: &Query) -> CoreResult<SearchResult> {
        self.entity(entity)?;
        let core = self.index.slot(entity, SegmentKind::Core)?;
        let delta = self.index.slot(entity, SegmentKind::Delta)?;
        merger::merge(entity, &core, &delta, query)
    }

    /// Builds an entity's delta with the default build options.
    pub fn build_delta(&self, entity: &str) -> CoreResult<DeltaBuild> {
        self.build_delta_with(entity, &self.config.build)
    }

    /// Builds an entity's delta.
    pub fn build_delta_with(&self, entity: &str, options: &BuildOptions) -> CoreResult<DeltaBuild> {
        let config = self.entity(entity)?;
        delta::build_delta(self.ctx(), config, options)
    }

    /// Rebuilds an entity's core segment with the default build options.
    pub fn rebuild_core(&self, entity: &str) -> CoreResult<RebuildReport> {
        self.rebuild_core_with(entity, &self.config.build)
    }

    /// Rebuilds an entity's core segment, clears its dirty markers and
    /// rebuilds its delta from what is left.
    pub fn rebuild_core_with(
        &self,
        entity: &str,
        options: &BuildOptions,
    ) -> CoreResult<RebuildReport> {
        let config = self.entity(entity)?;
        rebuild::rebuild_core(self.ctx(), config, options)
    }

    /// Rebuilds every enabled entity. Stops at the first failure.
    pub fn rebuild_all(&self) -> CoreResult<Vec<RebuildReport>> {
        self.rebuild_all_with(&self.config.build)
    }

    /// Rebuilds every enabled entity with the given options.
    pub fn rebuild_all_with(&self, options: &BuildOptions) -> CoreResult<Vec<RebuildReport>> {
        self.entities
            .values()
            .map(|config| rebuild::rebuild_core(self.ctx(), config, options))
            .collect()
    }

    /// Builds the delta of every enabled entity that has one. Stops at the
    /// first failure.
    pub fn rebuild_deltas(&self) -> CoreResult<Vec<(String, DeltaBuild)>> {
        self.rebuild_deltas_with(&self.config.build)
    }

    /// Builds every delta with the given options.
    pub fn rebuild_deltas_with(
        &self,
        options: &BuildOptions,
    ) -> CoreResult<Vec<(String, DeltaBuild)>> {
        self.entities
            .values()
            .filter(|config| config.delta.tracks_changes())
            .map(|config| {
                delta::build_delta(self.ctx(), config, options).map(|b| (config.name.clone(), b))
            })
            .collect()
    }

    fn datetime_entities(&self) -> impl Iterator<Item = &EntityIndexConfig> {
        self.entities
            .values()
            .filter(|config| matches!(config.delta, DeltaStrategy::Datetime { .. }))
    }

    /// Builds the delta of every datetime entity whose eligible records
    /// changed since its last build.
    pub fn poll_thresholds(&self) -> CoreResult<Vec<(String, DeltaBuild)>> {
        let mut built = Vec::new();
        for config in self.datetime_entities() {
            let outcome = delta::build_delta(self.ctx(), config, &self.config.build)?;
            if matches!(outcome, DeltaBuild::Built { .. }) {
                built.push((config.name.clone(), outcome));
            }
        }
        Ok(built)
    }

    /// Enqueues a threshold job for every datetime entity whose delta is
    /// out of date.
    pub fn enqueue_due_thresholds(&self) -> CoreResult<Vec<JobId>> {
        let due: Vec<&str> = self
            .datetime_entities()
            .map(|config| Ok((config, delta::is_stale(self.ctx(), config)?)))
            .collect::<CoreResult<Vec<_>>>()?
            .into_iter()
            .filter(|(_, stale)| *stale)
            .map(|(config, _)| config.name.as_str())
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let _gate = self.gate.hold()?;
        self.queue.refresh()?;
        due.into_iter()
            .map(|entity| {
                self.queue
                    .enqueue(entity, SegmentKind::Delta, TriggerReason::Threshold, now)
                    .map(|(id, _)| id)
            })
            .collect()
    }

    /// Enqueues a build on behalf of an operator.
    pub fn enqueue_build(
        &self,
        entity: &str,
        target: SegmentKind,
        reason: TriggerReason,
    ) -> CoreResult<JobId> {
        self.entity(entity)?;
        let now = self.clock.now();
        let _gate = self.gate.hold()?;
        self.queue.refresh()?;
        let (id, _) = self.queue.enqueue(entity, target, reason, now)?;
        Ok(id)
    }

    /// Enqueues a fresh job for every failed job.
    pub fn retry_failed(&self) -> CoreResult<Vec<JobId>> {
        let now = self.clock.now();
        let _gate = self.gate.hold()?;
        self.queue.refresh()?;
        let targets: BTreeSet<(String, SegmentKind)> = self
            .queue
            .failed()
            .into_iter()
            .map(|job| (job.entity, job.target))
            .collect();
        targets
            .into_iter()
            .map(|(entity, target)| {
                self.queue
                    .enqueue(&entity, target, TriggerReason::Retry, now)
                    .map(|(id, _)| id)
            })
            .collect()
    }

    /// Runs a job's build. Does not change the job's state.
    pub fn execute_job(&self, job: &BuildJob) -> CoreResult<()> {
        match job.target {
            SegmentKind::Delta => self.build_delta(&job.entity).map(|_| ()),
            SegmentKind::Core => self.rebuild_core(&job.entity).map(|_| ()),
        }
    }

    /// Claims, runs and finishes the next job. Returns `None` when no job
    /// can be claimed.
    pub fn run_next_job(&self) -> CoreResult<Option<JobOutcome>> {
        let claimed = {
            let _gate = self.gate.hold()?;
            self.queue.refresh()?;
            self.queue.claim_next(self.clock.now())?
        };
        let Some(job) = claimed else {
            return Ok(None);
        };
        debug!(job = %job.id, entity = %job.entity, target = %job.target, "job claimed");

        let result = self
            .store
            .refresh()
            .and_then(|_| self.execute_job(&job));
        match self.finish_job(&job, result) {
            Ok(error) => {
                let job = self.queue.get(job.id).unwrap_or_else(|| {
                    // Dropped by compaction right after finishing.
                    let mut job = job;
                    job.state = match &error {
                        None => JobState::Completed,
                        Some(message) => JobState::Failed {
                            error: message.clone(),
                        },
                    };
                    job
                });
                Ok(Some(JobOutcome { job, error }))
            }
            Err(e) => {
                warn!(job = %job.id, entity = %job.entity, error = %e, "could not record job outcome; requeueing");
                self.requeue_job(job.id);
                Err(e)
            }
        }
    }

    /// Records a claimed job's result. Returns the failure message, if any.
    fn finish_job(&self, job: &BuildJob, result: CoreResult<()>) -> CoreResult<Option<String>> {
        let _gate = self.gate.hold()?;
        self.queue.refresh()?;
        let now = self.clock.now();
        match result {
            Ok(()) => {
                self.queue.complete(job.id, now)?;
                Ok(None)
            }
            Err(e) => {
                warn!(job = %job.id, entity = %job.entity, error = %e, "job failed");
                let message = e.to_string();
                self.queue.fail(job.id, message.clone(), now)?;
                Ok(Some(message))
            }
        }
    }

    /// Puts a claimed job back so the next claim picks it up again.
    fn requeue_job(&self, id: JobId) {
        let now = self.clock.now();
        let requeued = match self.gate.hold() {
            Ok(_gate) => self.queue.requeue(id, now),
            Err(e) => {
                debug!(job = %id, error = %e, "log gate unavailable; requeueing in memory");
                self.queue.requeue_local(id, now)
            }
        };
        if let Err(e) = requeued {
            warn!(job = %id, error = %e, "job left running until the next recovery");
        }
    }

    /// Returns jobs left Running by a dead worker to the queue.
    pub fn recover_abandoned_jobs(&self) -> CoreResult<Vec<JobId>> {
        let _gate = self.gate.hold()?;
        self.queue.refresh()?;
        self.queue.recover_abandoned()
    }

    /// Reserves the single worker slot of this engine (and, for persistent
    /// engines, of its directory).
    pub(crate) fn acquire_worker(&self) -> CoreResult<Option<WorkerLease>> {
        if self
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::WorkerLocked);
        }
        match self.dir.as_ref().map(IndexDir::worker_lease).transpose() {
            Ok(lease) => Ok(lease),
            Err(e) => {
                self.worker_active.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub(crate) fn release_worker(&self) {
        self.worker_active.store(false, Ordering::Release);
    }

    /// Returns the engine status.
    pub fn status(&self) -> CoreResult<EngineStatus> {
        let mut entities = Vec::with_capacity(self.entities.len());
        for config in self.entities.values() {
            let core = self.index.slot(&config.name, SegmentKind::Core)?;
            let delta = self.index.slot(&config.name, SegmentKind::Delta)?;
            entities.push(EntityStatus {
                name: config.name.clone(),
                strategy: config.delta.label(),
                records: self.store.len(&config.name),
                dirty: self.store.dirty_count(&config.name),
                core: SlotStatus::from(&core),
                delta: SlotStatus::from(&delta),
            });
        }
        Ok(EngineStatus {
            sequence: self.store.sequence(),
            entities,
            disabled: self.disabled.clone(),
            jobs: self.queue.stats(),
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("disabled", &self.disabled)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
