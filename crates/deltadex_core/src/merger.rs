//! Query-time merge of core and delta segments.
//!
//! The delta shadows the core: for a record covered by both segments the
//! entry with the higher revision wins, and the delta wins ties. A core hit
//! whose record the delta holds at a newer (or equal) revision is dropped
//! even when the delta's version does not match the query, and a delta kill
//! entry hides the record entirely.

use crate::error::{CoreError, CoreResult};
use crate::index_store::SegmentSlot;
use crate::query::Query;
use crate::segment::{Segment, SegmentKind};
use crate::types::{Generation, RecordId, SequenceNumber};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Record ID.
    pub id: RecordId,
    /// Revision of the indexed document.
    pub revision: SequenceNumber,
    /// Segment the hit came from.
    pub source: SegmentKind,
    /// Stored field values.
    pub fields: BTreeMap<String, String>,
}

/// Merged search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// Hits in ID order.
    pub hits: Vec<SearchHit>,
    /// Set when one segment could not be served.
    pub degraded: Option<String>,
    /// Core generation that answered, if any.
    pub core_generation: Option<Generation>,
    /// Delta generation that answered, if any.
    pub delta_generation: Option<Generation>,
}

impl SearchResult {
    /// IDs of the hits, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.hits.iter().map(|hit| hit.id).collect()
    }

    /// Returns true if there are no hits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

fn hit(segment: &Segment, id: RecordId) -> Option<SearchHit> {
    segment.document(id).map(|doc| SearchHit {
        id,
        revision: doc.revision,
        source: segment.kind(),
        fields: doc.fields.clone(),
    })
}

/// Runs `query` against both slots of an entity and merges the results.
///
/// # Errors
///
/// Returns [`CoreError::SegmentUnavailable`] only when both slots are
/// unavailable. A single unavailable slot degrades the result instead.
pub fn merge(
    entity: &str,
    core: &SegmentSlot,
    delta: &SegmentSlot,
    query: &Query,
) -> CoreResult<SearchResult> {
    let mut result = SearchResult::default();

    match (core, delta) {
        (SegmentSlot::Unavailable(core_err), SegmentSlot::Unavailable(delta_err)) => {
            return Err(CoreError::SegmentUnavailable {
                entity: entity.to_string(),
                message: format!("core: {core_err}; delta: {delta_err}"),
            });
        }
        (SegmentSlot::Unavailable(reason), _) | (_, SegmentSlot::Unavailable(reason)) => {
            let kind = if matches!(core, SegmentSlot::Unavailable(_)) {
                SegmentKind::Core
            } else {
                SegmentKind::Delta
            };
            warn!(entity, %kind, reason = %reason, "serving degraded search results");
            result.degraded = Some(format!("{kind} segment unavailable: {reason}"));
        }
        _ => {}
    }

    let core = core.segment();
    let delta = delta.segment();
    result.core_generation = core.map(|s| s.generation());
    result.delta_generation = delta.map(|s| s.generation());

    if query.is_empty() {
        return Ok(result);
    }

    let mut hits: BTreeMap<RecordId, SearchHit> = BTreeMap::new();

    if let Some(core) = core {
        for id in core.matches(query) {
            let Some(hit) = hit(core, id) else { continue };
            let shadowed = delta
                .and_then(|d| d.revision_of(id))
                .is_some_and(|rev| rev >= hit.revision);
            if !shadowed {
                hits.insert(id, hit);
            }
        }
    }

    if let Some(delta) = delta {
        for id in delta.matches(query) {
            let Some(hit) = hit(delta, id) else { continue };
            let stale = core
                .and_then(|c| c.document(id))
                .is_some_and(|doc| doc.revision > hit.revision);
            if !stale {
                hits.insert(id, hit);
            }
        }
    }

    result.hits = hits.into_values().collect();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::segment::SegmentBuilder;
    use crate::tokenizer::TokenizerConfig;
    use crate::types::Timestamp;
    use std::sync::Arc;

    fn doc(id: u64, revision: u64, title: &str) -> Document {
        Document {
            id: RecordId::new(id),
            revision: SequenceNumber::new(revision),
            fields: BTreeMap::from([("title".to_string(), title.to_string())]),
        }
    }

    fn slot(kind: SegmentKind, docs: Vec<Document>, kills: &[(u64, u64)]) -> SegmentSlot {
        let mut builder = SegmentBuilder::new(
            "articles",
            kind,
            Generation::new(1),
            TokenizerConfig::default(),
        );
        for d in docs {
            builder.add_document(d);
        }
        for (id, rev) in kills {
            builder.add_kill(RecordId::new(*id), SequenceNumber::new(*rev));
        }
        SegmentSlot::Ready(Arc::new(builder.finish(Timestamp::from_millis(0))))
    }

    fn search(core: &SegmentSlot, delta: &SegmentSlot, q: &str) -> SearchResult {
        merge("articles", core, delta, &Query::parse(q).unwrap()).unwrap()
    }

    fn ids(result: &SearchResult) -> Vec<u64> {
        result.ids().into_iter().map(RecordId::as_u64).collect()
    }

    #[test]
    fn delta_shadows_core() {
        let core = slot(
            SegmentKind::Core,
            vec![doc(1, 1, "old title"), doc(2, 2, "old news")],
            &[],
        );
        let delta = slot(SegmentKind::Delta, vec![doc(1, 5, "new title")], &[]);

        assert_eq!(ids(&search(&core, &delta, "old")), vec![2]);
        let result = search(&core, &delta, "title");
        assert_eq!(ids(&result), vec![1]);
        assert_eq!(result.hits[0].source, SegmentKind::Delta);
        assert_eq!(result.hits[0].revision, SequenceNumber::new(5));
    }

    #[test]
    fn newer_core_beats_stale_delta() {
        let core = slot(SegmentKind::Core, vec![doc(1, 9, "fresh")], &[]);
        let delta = slot(SegmentKind::Delta, vec![doc(1, 4, "stale")], &[]);
        assert!(search(&core, &delta, "stale").is_empty());
        assert_eq!(ids(&search(&core, &delta, "fresh")), vec![1]);
    }

    #[test]
    fn equal_revisions_prefer_delta() {
        let core = slot(SegmentKind::Core, vec![doc(1, 3, "same text")], &[]);
        let delta = slot(SegmentKind::Delta, vec![doc(1, 3, "same text")], &[]);
        let result = search(&core, &delta, "same");
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].source, SegmentKind::Delta);
    }

    #[test]
    fn kills_hide_core_documents() {
        let core = slot(SegmentKind::Core, vec![doc(1, 1, "gone"), doc(2, 1, "gone")], &[]);
        let delta = slot(SegmentKind::Delta, vec![], &[(1, 2)]);
        assert_eq!(ids(&search(&core, &delta, "gone")), vec![2]);
    }

    #[test]
    fn empty_slots_and_queries() {
        let core = slot(SegmentKind::Core, vec![doc(1, 1, "x")], &[]);
        let empty = SegmentSlot::Empty;
        assert_eq!(ids(&search(&core, &empty, "x")), vec![1]);
        assert!(search(&empty, &empty, "x").is_empty());
        assert!(search(&core, &empty, "").is_empty());
    }

    #[test]
    fn one_unavailable_slot_degrades() {
        let core = SegmentSlot::Unavailable("checksum mismatch".into());
        let delta = slot(SegmentKind::Delta, vec![doc(3, 1, "survivor")], &[]);
        let result = search(&core, &delta, "survivor");
        assert_eq!(ids(&result), vec![3]);
        assert!(result.degraded.unwrap().contains("core"));
    }

    #[test]
    fn both_unavailable_fails() {
        let bad = SegmentSlot::Unavailable("missing".into());
        assert!(matches!(
            merge("articles", &bad, &bad, &Query::parse("x").unwrap()),
            Err(CoreError::SegmentUnavailable { .. })
        ));
    }
}
