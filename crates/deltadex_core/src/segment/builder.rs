//! Segment construction.

use super::{Segment, SegmentKind, StoredDocument};
use crate::document::Document;
use crate::tokenizer::TokenizerConfig;
use crate::types::{Generation, RecordId, SequenceNumber, Timestamp};
use std::collections::{BTreeMap, BTreeSet};

/// Accumulates documents and kills into a [`Segment`].
///
/// Adding a document for an ID that is already present replaces it.
#[derive(Debug)]
pub struct SegmentBuilder {
    entity: String,
    kind: SegmentKind,
    generation: Generation,
    tokenizer: TokenizerConfig,
    documents: BTreeMap<RecordId, StoredDocument>,
    kills: BTreeMap<RecordId, SequenceNumber>,
}

impl SegmentBuilder {
    /// Starts a segment.
    pub fn new(
        entity: impl Into<String>,
        kind: SegmentKind,
        generation: Generation,
        tokenizer: TokenizerConfig,
    ) -> Self {
        Self {
            entity: entity.into(),
            kind,
            generation,
            tokenizer,
            documents: BTreeMap::new(),
            kills: BTreeMap::new(),
        }
    }

    /// Adds a document.
    pub fn add_document(&mut self, document: Document) {
        self.kills.remove(&document.id);
        self.documents.insert(
            document.id,
            StoredDocument {
                revision: document.revision,
                fields: document.fields,
            },
        );
    }

    /// Adds a kill entry for a deleted record.
    pub fn add_kill(&mut self, id: RecordId, revision: SequenceNumber) {
        self.documents.remove(&id);
        self.kills.insert(id, revision);
    }

    /// Number of documents added so far.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Tokenizes every document and seals the segment.
    #[must_use]
    pub fn finish(self, built_at: Timestamp) -> Segment {
        let mut terms: BTreeMap<String, BTreeSet<RecordId>> = BTreeMap::new();
        let mut field_terms: BTreeMap<String, BTreeMap<String, BTreeSet<RecordId>>> =
            BTreeMap::new();

        for (id, doc) in &self.documents {
            for (field, text) in &doc.fields {
                let tokens = self.tokenizer.tokenize(text);
                if tokens.is_empty() {
                    continue;
                }
                let per_field = field_terms.entry(field.clone()).or_default();
                for token in tokens {
                    terms.entry(token.clone()).or_default().insert(*id);
                    per_field.entry(token).or_default().insert(*id);
                }
            }
        }

        Segment {
            entity: self.entity,
            kind: self.kind,
            generation: self.generation,
            built_at,
            tokenizer: self.tokenizer,
            documents: self.documents,
            terms,
            field_terms,
            kills: self.kills,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    #[test]
    fn later_entries_replace_earlier_ones() {
        let mut builder = SegmentBuilder::new(
            "articles",
            SegmentKind::Delta,
            Generation::new(1),
            TokenizerConfig::default(),
        );
        let id = RecordId::new(1);
        builder.add_document(Document {
            id,
            revision: SequenceNumber::new(1),
            fields: BTreeMap::from([("title".to_string(), "old".to_string())]),
        });
        builder.add_kill(id, SequenceNumber::new(2));
        assert_eq!(builder.document_count(), 0);

        builder.add_document(Document {
            id,
            revision: SequenceNumber::new(3),
            fields: BTreeMap::from([("title".to_string(), "new".to_string())]),
        });
        let segment = builder.finish(Timestamp::from_millis(0));

        assert_eq!(segment.kills().count(), 0);
        assert_eq!(segment.revision_of(id), Some(SequenceNumber::new(3)));
        assert!(segment.matches(&Query::parse("old").unwrap()).is_empty());
        assert_eq!(segment.matches(&Query::parse("new").unwrap()).len(), 1);
    }
}
