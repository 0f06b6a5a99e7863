//! # deltadex core
//!
//! Main+delta full-text indexing over a journaled record store.
//!
//! This crate provides:
//! - A record store whose rows carry dirty markers, journaled to disk
//! - Per-entity index configuration with four delta strategies
//! - Core and delta segment builds behind a pluggable [`Indexer`]
//! - Query-time merging where the delta shadows the core
//! - A persistent build job queue drained by a single [`Worker`]
//!
//! ```rust,ignore
//! use deltadex_core::{DeltaStrategy, Engine, EngineConfig, EntityIndexConfig, FieldSpec, TableSchema};
//!
//! let config = EngineConfig::new()
//!     .table(TableSchema::new("articles", &["title", "delta"]))
//!     .entity(
//!         EntityIndexConfig::new("articles")
//!             .field(FieldSpec::column("title"))
//!             .delta(DeltaStrategy::Immediate),
//!     );
//! let engine = Engine::open("./index", config)?;
//! engine.insert("articles", RecordId::new(1), columns)?;
//! let result = engine.search("articles", "title:hello")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod delta;
mod dir;
mod document;
mod engine;
mod error;
mod index_store;
mod indexer;
mod jobs;
mod journal;
mod merger;
mod query;
mod rebuild;
mod segment;
mod store;
mod tokenizer;
mod tracker;
mod types;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BuildOptions, DeltaStrategy, EngineConfig, EntityIndexConfig, FieldSource, FieldSpec,
    WorkerConfig, DEFAULT_FLAG_COLUMN, DEFAULT_TIMESTAMP_COLUMN,
};
pub use delta::{is_eligible, DeltaBuild};
pub use dir::{DirLock, IndexDir, WorkerLease};
pub use document::{Document, DocumentAssembler};
pub use engine::{
    Engine, EngineBuilder, EngineStatus, EntityStatus, JobOutcome, MutationReport, SlotStatus,
};
pub use error::{CoreError, CoreResult};
pub use index_store::{IndexStore, SegmentSlot};
pub use indexer::{BuildOutput, BuildRequest, Indexer, NativeIndexer};
pub use jobs::{BuildJob, JobId, JobQueue, JobState, QueueStats, TriggerReason};
pub use merger::{merge, SearchHit, SearchResult};
pub use query::{Clause, Query};
pub use rebuild::RebuildReport;
pub use segment::{
    Segment, SegmentBuilder, SegmentKind, StoredDocument, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC,
};
pub use store::{
    CleanOutcome, DirtyMark, Record, RecordStore, Snapshot, TableSchema, TableSnapshot, Tombstone,
};
pub use tokenizer::TokenizerConfig;
pub use tracker::{ChangeTracker, DeltaAction};
pub use types::{Generation, RecordId, SequenceNumber, Timestamp};
pub use worker::{DrainReport, Worker, WorkerHandle};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
