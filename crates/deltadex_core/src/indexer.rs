//! The indexing tool seam.
//!
//! Builders assemble documents and hand them to an [`Indexer`], which turns
//! them into a [`Segment`]. The engine ships with [`NativeIndexer`]; tests
//! substitute indexers that fail on demand.

use crate::clock::Clock;
use crate::config::{BuildOptions, EntityIndexConfig};
use crate::dir::LogGate;
use crate::document::Document;
use crate::error::CoreResult;
use crate::index_store::IndexStore;
use crate::segment::{Segment, SegmentBuilder, SegmentKind};
use crate::store::RecordStore;
use crate::types::{Generation, RecordId, SequenceNumber, Timestamp};
use std::fmt;
use tracing::{info, trace};

/// Everything an indexer needs for one build.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    /// Entity being indexed.
    pub entity: &'a EntityIndexConfig,
    /// Segment kind to produce.
    pub kind: SegmentKind,
    /// Generation to stamp on the segment.
    pub generation: Generation,
    /// Documents to index.
    pub documents: Vec<Document>,
    /// Deleted records to hide from older segments.
    pub kills: Vec<(RecordId, SequenceNumber)>,
    /// Build options, including output suppression.
    pub options: &'a BuildOptions,
    /// Build timestamp.
    pub built_at: Timestamp,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildOutput {
    /// The new segment.
    pub segment: Segment,
    /// Tool output, one line per entry.
    pub log: Vec<String>,
}

/// Produces segments from documents.
pub trait Indexer: Send + Sync + fmt::Debug {
    /// Builds a segment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::BuildFailed`] if the segment cannot be
    /// produced. The caller keeps serving the previous segment.
    fn build(&self, request: BuildRequest<'_>) -> CoreResult<BuildOutput>;
}

/// In-process indexer backed by [`SegmentBuilder`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeIndexer;

impl Indexer for NativeIndexer {
    fn build(&self, request: BuildRequest<'_>) -> CoreResult<BuildOutput> {
        let BuildRequest {
            entity,
            kind,
            generation,
            documents,
            kills,
            options,
            built_at,
        } = request;

        let mut log = vec![format!(
            "indexing {} ({kind}): collecting {} documents",
            entity.name,
            documents.len()
        )];

        let mut builder =
            SegmentBuilder::new(&entity.name, kind, generation, options.tokenizer.clone());
        for document in documents {
            builder.add_document(document);
        }
        for (id, revision) in kills {
            builder.add_kill(id, revision);
        }
        let segment = builder.finish(built_at);

        log.push(format!(
            "total {} docs, {} terms, {} killed",
            segment.len(),
            segment.term_count(),
            segment.kills().count()
        ));
        log.push(format!("wrote {} {kind} segment {generation}", entity.name));

        Ok(BuildOutput { segment, log })
    }
}

/// Shared handles for delta builds and core rebuilds.
#[derive(Clone, Copy)]
pub(crate) struct BuildContext<'a> {
    pub(crate) store: &'a RecordStore,
    pub(crate) index: &'a IndexStore,
    pub(crate) indexer: &'a dyn Indexer,
    pub(crate) clock: &'a dyn Clock,
    pub(crate) gate: &'a LogGate,
}

/// Emits indexer output, honoring the suppression switch.
pub(crate) fn emit_log(entity: &str, kind: SegmentKind, lines: &[String], options: &BuildOptions) {
    for line in lines {
        if options.quiet {
            trace!(entity, %kind, "{line}");
        } else {
            info!(entity, %kind, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use std::collections::BTreeMap;

    #[test]
    fn native_indexer_builds_segment_and_reports() {
        let entity = EntityIndexConfig::new("articles").field(FieldSpec::column("title"));
        let options = BuildOptions::default();
        let output = NativeIndexer
            .build(BuildRequest {
                entity: &entity,
                kind: SegmentKind::Delta,
                generation: Generation::new(4),
                documents: vec![Document {
                    id: RecordId::new(1),
                    revision: SequenceNumber::new(2),
                    fields: BTreeMap::from([("title".to_string(), "hello".to_string())]),
                }],
                kills: vec![(RecordId::new(2), SequenceNumber::new(3))],
                options: &options,
                built_at: Timestamp::from_millis(5),
            })
            .unwrap();

        assert_eq!(output.segment.kind(), SegmentKind::Delta);
        assert_eq!(output.segment.generation(), Generation::new(4));
        assert_eq!(output.segment.len(), 1);
        assert_eq!(output.log.len(), 3);
        assert!(output.log[2].contains("gen:4"));
    }
}
