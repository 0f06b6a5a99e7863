//! Delta segment builds.
//!
//! A delta build covers the entity's dirty records that are eligible under
//! its strategy, plus kill entries for dirty tombstones. It replaces the
//! whole delta segment; on failure the previous delta keeps being served.

use crate::config::{BuildOptions, DeltaStrategy, EntityIndexConfig};
use crate::document::DocumentAssembler;
use crate::error::{CoreError, CoreResult};
use crate::index_store::SegmentSlot;
use crate::indexer::{emit_log, BuildContext, BuildRequest};
use crate::segment::{Segment, SegmentKind};
use crate::store::{DirtyMark, Snapshot};
use crate::types::{Generation, RecordId, SequenceNumber, Timestamp};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Outcome of a delta build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaBuild {
    /// A new delta segment is being served.
    Built {
        /// Its generation.
        generation: Generation,
        /// Documents it holds.
        documents: usize,
        /// Kill entries it holds.
        kills: usize,
    },
    /// The served delta already covers exactly the eligible records.
    Unchanged,
    /// The entity's strategy has no delta.
    NoDelta,
}

/// Returns true if a dirty mark may go into a delta built at `now`.
///
/// Flag strategies take every mark. The datetime strategy takes marks whose
/// settling time has passed: `mark.at + threshold <= now`.
#[must_use]
pub fn is_eligible(strategy: &DeltaStrategy, mark: &DirtyMark, now: Timestamp) -> bool {
    match strategy {
        DeltaStrategy::None => false,
        DeltaStrategy::Immediate | DeltaStrategy::Delayed => true,
        DeltaStrategy::Datetime { threshold } => mark.at.saturating_add(*threshold) <= now,
    }
}

/// Records and tombstones of the entity that a build at a given time takes.
struct Eligible {
    records: Vec<RecordId>,
    kills: BTreeMap<RecordId, SequenceNumber>,
    /// Every (id, revision) the resulting delta would cover.
    coverage: BTreeMap<RecordId, SequenceNumber>,
}

fn eligible(entity: &EntityIndexConfig, snapshot: &Snapshot, now: Timestamp) -> Eligible {
    let table = snapshot.table(&entity.name);
    let check = |mark: &Option<DirtyMark>| {
        mark.as_ref()
            .is_some_and(|m| is_eligible(&entity.delta, m, now))
    };

    let mut eligible = Eligible {
        records: Vec::new(),
        kills: BTreeMap::new(),
        coverage: BTreeMap::new(),
    };
    for record in table.records.values().filter(|r| check(&r.dirty)) {
        eligible.records.push(record.id);
        eligible.coverage.insert(record.id, record.revision);
    }
    for tombstone in table.tombstones.values().filter(|t| check(&t.dirty)) {
        eligible.kills.insert(tombstone.id, tombstone.revision);
        eligible.coverage.insert(tombstone.id, tombstone.revision);
    }
    eligible
}

fn is_current(slot: &SegmentSlot, coverage: &BTreeMap<RecordId, SequenceNumber>) -> bool {
    match slot {
        SegmentSlot::Empty => coverage.is_empty(),
        SegmentSlot::Ready(segment) => segment.coverage() == *coverage,
        SegmentSlot::Unavailable(_) => false,
    }
}

/// Returns true if a delta build now would change the served delta.
pub(crate) fn is_stale(ctx: BuildContext<'_>, entity: &EntityIndexConfig) -> CoreResult<bool> {
    if !entity.delta.tracks_changes() {
        return Ok(false);
    }
    let snapshot = ctx.store.snapshot(&[entity.name.as_str()])?;
    let eligible = eligible(entity, &snapshot, ctx.clock.now());
    let slot = ctx.index.slot(&entity.name, SegmentKind::Delta)?;
    Ok(!is_current(&slot, &eligible.coverage))
}

/// Runs the indexer and normalizes its errors to [`CoreError::BuildFailed`].
pub(crate) fn run_indexer(
    ctx: BuildContext<'_>,
    request: BuildRequest<'_>,
) -> CoreResult<Segment> {
    let entity = request.entity.name.clone();
    let kind = request.kind;
    let options = request.options;
    match ctx.indexer.build(request) {
        Ok(output) => {
            emit_log(&entity, kind, &output.log, options);
            Ok(output.segment)
        }
        Err(e) => {
            warn!(entity = %entity, %kind, error = %e, "index build failed; keeping previous segment");
            Err(match e {
                e @ CoreError::BuildFailed { .. } => e,
                other => CoreError::build_failed(entity, kind, other.to_string()),
            })
        }
    }
}

/// Builds and serves a new delta segment for the entity.
///
/// Builds of one entity's delta are serialized. The build is skipped when
/// the served delta already matches the eligible records, which makes
/// repeated triggers (polls, coalesced jobs) cheap.
pub(crate) fn build_delta(
    ctx: BuildContext<'_>,
    entity: &EntityIndexConfig,
    options: &BuildOptions,
) -> CoreResult<DeltaBuild> {
    if !entity.delta.tracks_changes() {
        return Ok(DeltaBuild::NoDelta);
    }

    let lock = ctx.index.build_lock(&entity.name, SegmentKind::Delta)?;
    let _build = lock.lock();

    let now = ctx.clock.now();
    let snapshot = ctx.store.snapshot(&entity.source_tables())?;
    let Eligible {
        records,
        kills,
        coverage,
    } = eligible(entity, &snapshot, now);

    let slot = ctx.index.slot(&entity.name, SegmentKind::Delta)?;
    if is_current(&slot, &coverage) {
        debug!(entity = %entity.name, "delta unchanged; skipping build");
        return Ok(DeltaBuild::Unchanged);
    }

    let assembler = DocumentAssembler::new(entity, &snapshot);
    let table = snapshot.table(&entity.name);
    let documents: Vec<_> = records
        .iter()
        .filter_map(|id| table.records.get(id))
        .map(|record| assembler.assemble(record))
        .collect();
    let generation = ctx.index.next_generation(&entity.name, SegmentKind::Delta)?;
    let document_count = documents.len();
    let kill_count = kills.len();

    let segment = run_indexer(
        ctx,
        BuildRequest {
            entity,
            kind: SegmentKind::Delta,
            generation,
            documents,
            kills: kills.into_iter().collect(),
            options,
            built_at: now,
        },
    )?;
    ctx.index.replace(segment)?;

    info!(
        entity = %entity.name,
        %generation,
        documents = document_count,
        kills = kill_count,
        "delta segment built"
    );
    Ok(DeltaBuild::Built {
        generation,
        documents: document_count,
        kills: kill_count,
    })
}
