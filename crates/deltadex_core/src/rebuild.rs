//! Core rebuilds.
//!
//! A rebuild indexes a snapshot of every record of the entity into a new
//! core segment, then clears the dirty markers of records that have not
//! changed since the snapshot and purges the snapshotted tombstones. The
//! delta is rebuilt last so it only holds what the new core is missing.

use crate::config::{BuildOptions, EntityIndexConfig};
use crate::delta::{build_delta, run_indexer, DeltaBuild};
use crate::document::DocumentAssembler;
use crate::error::CoreResult;
use crate::indexer::{BuildContext, BuildRequest};
use crate::segment::SegmentKind;
use crate::store::CleanOutcome;
use crate::types::{Generation, SequenceNumber};
use tracing::info;

/// Summary of a core rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Entity rebuilt.
    pub entity: String,
    /// Generation of the new core segment.
    pub generation: Generation,
    /// Store sequence at snapshot time.
    pub snapshot_sequence: SequenceNumber,
    /// Documents in the new core segment.
    pub documents: usize,
    /// Dirty markers cleared and tombstones purged.
    pub cleaned: CleanOutcome,
    /// What happened to the delta afterwards.
    pub delta: DeltaBuild,
}

pub(crate) fn rebuild_core(
    ctx: BuildContext<'_>,
    entity: &EntityIndexConfig,
    options: &BuildOptions,
) -> CoreResult<RebuildReport> {
    let lock = ctx.index.build_lock(&entity.name, SegmentKind::Core)?;
    let _build = lock.lock();

    let now = ctx.clock.now();
    let snapshot = ctx.store.snapshot(&entity.source_tables())?;
    let documents = DocumentAssembler::new(entity, &snapshot).assemble_all();
    let document_count = documents.len();
    let generation = ctx.index.next_generation(&entity.name, SegmentKind::Core)?;

    let segment = run_indexer(
        ctx,
        BuildRequest {
            entity,
            kind: SegmentKind::Core,
            generation,
            documents,
            kills: Vec::new(),
            options,
            built_at: now,
        },
    )?;
    ctx.index.replace(segment)?;

    let cleaned = {
        let _gate = ctx.gate.hold()?;
        ctx.store.refresh()?;
        ctx.store.clean(&entity.name, snapshot.table(&entity.name))?
    };
    info!(
        entity = %entity.name,
        %generation,
        documents = document_count,
        cleared = cleaned.cleared,
        purged = cleaned.purged,
        still_dirty = cleaned.still_dirty,
        "core segment rebuilt"
    );

    let delta = build_delta(ctx, entity, options)?;
    Ok(RebuildReport {
        entity: entity.name.clone(),
        generation,
        snapshot_sequence: snapshot.sequence,
        documents: document_count,
        cleaned,
        delta,
    })
}
