//! Immutable index segments.
//!
//! A segment is the queryable artifact of one build: stored documents, an
//! inverted index over all fields, a per-field inverted index and a kill
//! list of deleted records. Segments are never modified after
//! [`SegmentBuilder::finish`]; a new build produces a new segment with the
//! next generation.
//!
//! ## File Format
//!
//! ```text
//! | magic "DDXS" (4) | version (2) | payload_len (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of the segment. The CRC covers the
//! payload only.

mod builder;

pub use builder::SegmentBuilder;

use crate::error::{CoreError, CoreResult};
use crate::journal::{from_cbor, to_cbor};
use crate::query::Query;
use crate::tokenizer::TokenizerConfig;
use crate::types::{Generation, RecordId, SequenceNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Segment file magic.
pub const SEGMENT_MAGIC: [u8; 4] = *b"DDXS";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Which of an entity's two segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Full corpus.
    Core,
    /// Records dirtied since the last core rebuild.
    Delta,
}

impl SegmentKind {
    /// Lower-case name, used in file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Delta => "delta",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document as stored in a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Record revision the document was built from.
    pub revision: SequenceNumber,
    /// Field values.
    pub fields: BTreeMap<String, String>,
}

/// An immutable index segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    entity: String,
    kind: SegmentKind,
    generation: Generation,
    built_at: Timestamp,
    tokenizer: TokenizerConfig,
    documents: BTreeMap<RecordId, StoredDocument>,
    terms: BTreeMap<String, BTreeSet<RecordId>>,
    field_terms: BTreeMap<String, BTreeMap<String, BTreeSet<RecordId>>>,
    kills: BTreeMap<RecordId, SequenceNumber>,
}

impl Segment {
    /// Entity the segment indexes.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Core or delta.
    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Build generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// When the segment was built.
    #[must_use]
    pub fn built_at(&self) -> Timestamp {
        self.built_at
    }

    /// Tokenizer the segment was built with.
    #[must_use]
    pub fn tokenizer(&self) -> &TokenizerConfig {
        &self.tokenizer
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the segment has neither documents nor kills.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.kills.is_empty()
    }

    /// Number of distinct terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Returns a stored document.
    #[must_use]
    pub fn document(&self, id: RecordId) -> Option<&StoredDocument> {
        self.documents.get(&id)
    }

    /// Iterates over kill entries in ID order.
    pub fn kills(&self) -> impl Iterator<Item = (RecordId, SequenceNumber)> + '_ {
        self.kills.iter().map(|(id, rev)| (*id, *rev))
    }

    /// Revision this segment holds for a record, from a document or a kill.
    #[must_use]
    pub fn revision_of(&self, id: RecordId) -> Option<SequenceNumber> {
        self.documents
            .get(&id)
            .map(|doc| doc.revision)
            .or_else(|| self.kills.get(&id).copied())
    }

    /// Every (id, revision) pair the segment covers, documents and kills.
    #[must_use]
    pub fn coverage(&self) -> BTreeMap<RecordId, SequenceNumber> {
        let mut covered: BTreeMap<RecordId, SequenceNumber> = self.kills.clone();
        covered.extend(self.documents.iter().map(|(id, doc)| (*id, doc.revision)));
        covered
    }

    fn postings(&self, field: Option<&str>, token: &str, prefix: bool) -> BTreeSet<RecordId> {
        let index = match field {
            Some(field) => match self.field_terms.get(field) {
                Some(index) => index,
                None => return BTreeSet::new(),
            },
            None => &self.terms,
        };
        if prefix {
            index
                .range(token.to_string()..)
                .take_while(|(term, _)| term.starts_with(token))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        } else {
            index.get(token).cloned().unwrap_or_default()
        }
    }

    /// Returns the IDs of documents matching every clause of the query.
    ///
    /// Clauses whose text has no indexable tokens are ignored; a query with
    /// nothing left to match returns no documents.
    #[must_use]
    pub fn matches(&self, query: &Query) -> BTreeSet<RecordId> {
        let mut result: Option<BTreeSet<RecordId>> = None;

        for clause in query.clauses() {
            let tokens = self.tokenizer.tokenize(&clause.text);
            let last = tokens.len().saturating_sub(1);
            for (i, token) in tokens.iter().enumerate() {
                let prefix = clause.prefix && i == last;
                let ids = self.postings(clause.field.as_deref(), token, prefix);
                let narrowed = match result.take() {
                    Some(acc) => acc.intersection(&ids).copied().collect(),
                    None => ids,
                };
                if narrowed.is_empty() {
                    return BTreeSet::new();
                }
                result = Some(narrowed);
            }
        }

        result.unwrap_or_default()
    }

    /// Encodes the segment into its file format.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = to_cbor(self)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::segment_corruption("segment exceeds 4 GiB"))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(buf)
    }

    /// Decodes a segment from its file format.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(CoreError::segment_corruption(format!(
                "segment file too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(CoreError::segment_corruption("bad segment magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(CoreError::segment_corruption(format!(
                "unsupported segment format version {version}"
            )));
        }
        let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != HEADER_SIZE + len + CRC_SIZE {
            return Err(CoreError::segment_corruption(format!(
                "segment length mismatch: header says {len}, file has {}",
                data.len().saturating_sub(HEADER_SIZE + CRC_SIZE)
            )));
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + len];
        let crc = &data[HEADER_SIZE + len..];
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        from_cbor(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn doc(id: u64, revision: u64, fields: &[(&str, &str)]) -> Document {
        Document {
            id: RecordId::new(id),
            revision: SequenceNumber::new(revision),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    fn sample() -> Segment {
        let mut builder = SegmentBuilder::new(
            "articles",
            SegmentKind::Core,
            Generation::new(3),
            TokenizerConfig::default(),
        );
        builder.add_document(doc(1, 5, &[("title", "Rust delta"), ("body", "indexing")]));
        builder.add_document(doc(2, 6, &[("title", "Core rebuild"), ("body", "rust")]));
        builder.add_kill(RecordId::new(9), SequenceNumber::new(7));
        builder.finish(Timestamp::from_millis(42))
    }

    fn ids(segment: &Segment, query: &str) -> Vec<u64> {
        segment
            .matches(&Query::parse(query).unwrap())
            .into_iter()
            .map(RecordId::as_u64)
            .collect()
    }

    #[test]
    fn matches_terms_with_and_semantics() {
        let segment = sample();
        assert_eq!(ids(&segment, "rust"), vec![1, 2]);
        assert_eq!(ids(&segment, "RUST delta"), vec![1]);
        assert!(ids(&segment, "rust missing").is_empty());
    }

    #[test]
    fn field_and_prefix_clauses() {
        let segment = sample();
        assert_eq!(ids(&segment, "title:rust"), vec![1]);
        assert_eq!(ids(&segment, "body:rust"), vec![2]);
        assert_eq!(ids(&segment, "reb*"), vec![2]);
        assert!(ids(&segment, "nofield:rust").is_empty());
    }

    #[test]
    fn empty_query_matches_nothing() {
        assert!(ids(&sample(), "").is_empty());
        assert!(ids(&sample(), ",,,").is_empty());
    }

    #[test]
    fn revision_covers_documents_and_kills() {
        let segment = sample();
        assert_eq!(segment.revision_of(RecordId::new(1)), Some(SequenceNumber::new(5)));
        assert_eq!(segment.revision_of(RecordId::new(9)), Some(SequenceNumber::new(7)));
        assert_eq!(segment.revision_of(RecordId::new(4)), None);
        assert_eq!(segment.coverage().len(), 3);
    }

    #[test]
    fn encode_decode_preserves_segment() {
        let segment = sample();
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn decode_detects_corruption() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            Segment::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            Segment::decode(b"nope"),
            Err(CoreError::SegmentCorruption { .. })
        ));
    }
}
