//! Error types for deltadex core.

use crate::jobs::JobId;
use crate::segment::SegmentKind;
use crate::types::RecordId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in deltadex core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] deltadex_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A framed log is corrupted or out of sync.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A segment file is corrupted or has an unknown format.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// An entity's index configuration is invalid.
    #[error("invalid configuration for entity {entity}: {message}")]
    InvalidConfig {
        /// The entity whose configuration was rejected.
        entity: String,
        /// What is wrong with it.
        message: String,
    },

    /// No index is configured for the entity.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// Name of the entity.
        name: String,
    },

    /// Indexing for the entity was disabled at setup.
    #[error("entity {name} is disabled: {reason}")]
    EntityDisabled {
        /// Name of the entity.
        name: String,
        /// Configuration error that disabled it.
        reason: String,
    },

    /// The table does not exist.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Name of the table.
        name: String,
    },

    /// The column is not part of the table schema.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Record not found.
    #[error("record {id} not found in table {table}")]
    RecordNotFound {
        /// Table name.
        table: String,
        /// The missing record.
        id: RecordId,
    },

    /// A record with this ID already exists.
    #[error("record {id} already exists in table {table}")]
    RecordExists {
        /// Table name.
        table: String,
        /// The duplicate record.
        id: RecordId,
    },

    /// The indexer failed to produce a segment.
    #[error("{kind} build failed for {entity}: {message}")]
    BuildFailed {
        /// Entity being indexed.
        entity: String,
        /// Segment kind being built.
        kind: SegmentKind,
        /// Indexer error output.
        message: String,
    },

    /// Neither segment of an entity can be served.
    #[error("no segment available for {entity}: {message}")]
    SegmentUnavailable {
        /// Entity being queried.
        entity: String,
        /// Why the segments are unavailable.
        message: String,
    },

    /// The search query could not be parsed.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },

    /// Build job not found.
    #[error("job {id} not found")]
    JobNotFound {
        /// The missing job.
        id: JobId,
    },

    /// A job state change that the state machine does not allow.
    #[error("invalid state transition for job {id}: {from} -> {to}")]
    InvalidStateTransition {
        /// The job.
        id: JobId,
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Another worker already owns the data directory.
    #[error("worker locked: another process is running the delta worker")]
    WorkerLocked,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown entity error.
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Creates an unknown table error.
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    /// Creates a build failed error.
    pub fn build_failed(
        entity: impl Into<String>,
        kind: SegmentKind,
        message: impl Into<String>,
    ) -> Self {
        Self::BuildFailed {
            entity: entity.into(),
            kind,
            message: message.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }
}
