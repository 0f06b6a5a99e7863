//! Record store with dirty tracking.
//!
//! The store holds the mutable side of the pipeline: tables of text records,
//! each carrying a revision and an optional [`DirtyMark`]. Deleted records
//! of indexed tables are kept as [`Tombstone`]s until the next core rebuild
//! so a delta segment can hide the stale core document.
//!
//! When opened over a [`StorageBackend`] every change is first appended to a
//! [`Journal`] and then applied in memory; reopening replays the journal.
//! Entries carry resulting state, so replaying an entry twice is harmless.

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::types::{RecordId, SequenceNumber, Timestamp};
use deltadex_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Schema of a table: its name and the columns it may hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column names.
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Creates a schema.
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// Returns true if the schema has the column.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Pending re-index marker.
///
/// Set once, on the first change after the record was last indexed into a
/// core segment. Further changes leave it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyMark {
    /// Sequence number of the change that dirtied the record.
    pub seq: SequenceNumber,
    /// Wall-clock time of that change.
    pub at: Timestamp,
}

/// A live record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: RecordId,
    /// Column values.
    pub columns: BTreeMap<String, String>,
    /// Sequence number of the latest mutation or touch.
    pub revision: SequenceNumber,
    /// Dirty marker, if the record awaits re-indexing.
    pub dirty: Option<DirtyMark>,
}

impl Record {
    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }

    /// Returns true if the record carries a dirty marker.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }
}

/// A deleted record awaiting the next core rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// ID of the deleted record.
    pub id: RecordId,
    /// Sequence number of the deletion (or a later touch).
    pub revision: SequenceNumber,
    /// Dirty marker.
    pub dirty: Option<DirtyMark>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    schema: Option<TableSchema>,
    records: BTreeMap<RecordId, Record>,
    tombstones: BTreeMap<RecordId, Tombstone>,
}

/// Point-in-time copy of one table.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    /// Live records by ID.
    pub records: BTreeMap<RecordId, Record>,
    /// Tombstones by ID.
    pub tombstones: BTreeMap<RecordId, Tombstone>,
}

/// Point-in-time copy of several tables, taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Store sequence when the snapshot was taken.
    pub sequence: SequenceNumber,
    /// Copied tables by name.
    pub tables: HashMap<String, TableSnapshot>,
}

impl Snapshot {
    /// Returns the copy of a table, or an empty one.
    #[must_use]
    pub fn table(&self, name: &str) -> &TableSnapshot {
        static EMPTY: std::sync::OnceLock<TableSnapshot> = std::sync::OnceLock::new();
        self.tables
            .get(name)
            .unwrap_or_else(|| EMPTY.get_or_init(TableSnapshot::default))
    }
}

/// Outcome of clearing dirty markers after a core rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanOutcome {
    /// Records whose marker was cleared.
    pub cleared: usize,
    /// Tombstones purged.
    pub purged: usize,
    /// Records or tombstones left dirty because they changed after the
    /// snapshot.
    pub still_dirty: usize,
}

/// A change as stored in the record journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoreEntry {
    Schema(TableSchema),
    Put {
        table: String,
        record: Record,
    },
    Delete {
        table: String,
        id: RecordId,
        tombstone: Option<Tombstone>,
    },
    Touch {
        table: String,
        id: RecordId,
        revision: SequenceNumber,
        dirty: Option<DirtyMark>,
    },
    Clean {
        table: String,
        cleared: Vec<RecordId>,
        purged: Vec<RecordId>,
    },
}

#[derive(Debug, Default)]
struct StoreState {
    sequence: SequenceNumber,
    tables: HashMap<String, Table>,
}

impl StoreState {
    fn next_sequence(&mut self) -> SequenceNumber {
        self.sequence = self.sequence.next();
        self.sequence
    }

    fn observe(&mut self, seq: SequenceNumber) {
        if seq > self.sequence {
            self.sequence = seq;
        }
    }

    fn table(&self, name: &str) -> CoreResult<&Table> {
        self.tables
            .get(name)
            .filter(|t| t.schema.is_some())
            .ok_or_else(|| CoreError::unknown_table(name))
    }

    fn apply(&mut self, entry: StoreEntry) {
        match entry {
            StoreEntry::Schema(schema) => {
                let table = self.tables.entry(schema.name.clone()).or_default();
                table.schema = Some(schema);
            }
            StoreEntry::Put { table, record } => {
                self.observe(record.revision);
                let table = self.tables.entry(table).or_default();
                table.tombstones.remove(&record.id);
                table.records.insert(record.id, record);
            }
            StoreEntry::Delete {
                table,
                id,
                tombstone,
            } => {
                if let Some(t) = &tombstone {
                    self.observe(t.revision);
                }
                let table = self.tables.entry(table).or_default();
                table.records.remove(&id);
                match tombstone {
                    Some(t) => {
                        table.tombstones.insert(id, t);
                    }
                    None => {
                        table.tombstones.remove(&id);
                    }
                }
            }
            StoreEntry::Touch {
                table,
                id,
                revision,
                dirty,
            } => {
                self.observe(revision);
                let table = self.tables.entry(table).or_default();
                if let Some(record) = table.records.get_mut(&id) {
                    record.revision = revision;
                    record.dirty = dirty;
                } else if let Some(tombstone) = table.tombstones.get_mut(&id) {
                    tombstone.revision = revision;
                    tombstone.dirty = dirty;
                }
            }
            StoreEntry::Clean {
                table,
                cleared,
                purged,
            } => {
                let table = self.tables.entry(table).or_default();
                for id in cleared {
                    if let Some(record) = table.records.get_mut(&id) {
                        record.dirty = None;
                    }
                }
                for id in purged {
                    table.tombstones.remove(&id);
                }
            }
        }
    }
}

/// Tables of records with dirty markers.
///
/// All methods take `&self`; the store is shared behind an `Arc` by the
/// engine, the builders and the worker.
pub struct RecordStore {
    state: RwLock<StoreState>,
    journal: Mutex<Option<Journal>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    /// Creates an empty, non-persistent store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            journal: Mutex::new(None),
        }
    }

    /// Opens a store over a backend, replaying its journal.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let store = Self {
            state: RwLock::new(StoreState::default()),
            journal: Mutex::new(Some(Journal::new(backend))),
        };
        let replayed = store.refresh()?;
        debug!(entries = replayed, "record journal replayed");
        Ok(store)
    }

    /// Applies journal entries appended by other processes.
    ///
    /// Returns the number of entries applied.
    pub fn refresh(&self) -> CoreResult<usize> {
        // Lock order is state, then journal (same as `commit`).
        let mut state = self.state.write();
        let mut journal = self.journal.lock();
        let Some(journal) = journal.as_mut() else {
            return Ok(0);
        };
        let entries: Vec<StoreEntry> = journal.read_new()?;
        let count = entries.len();
        for entry in entries {
            state.apply(entry);
        }
        Ok(count)
    }

    /// Applies pending entries, then drops a torn journal tail.
    ///
    /// Call under the directory lock. Returns the bytes removed.
    pub fn repair_tail(&self) -> CoreResult<u64> {
        self.refresh()?;
        let _state = self.state.write();
        match self.journal.lock().as_mut() {
            Some(journal) => journal.truncate_torn_tail(),
            None => Ok(0),
        }
    }

    /// Journals then applies an entry. Called with the state write lock held.
    fn commit(&self, state: &mut StoreState, entry: StoreEntry) -> CoreResult<()> {
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.append(std::slice::from_ref(&entry))?;
        }
        state.apply(entry);
        Ok(())
    }

    /// Returns the latest sequence number handed out.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.state.read().sequence
    }

    /// Creates the table if missing and adds any missing columns.
    ///
    /// Returns true if the schema changed.
    pub fn ensure_table(&self, schema: &TableSchema) -> CoreResult<bool> {
        let mut state = self.state.write();
        let merged = match state.tables.get(&schema.name).and_then(|t| t.schema.as_ref()) {
            Some(existing) => {
                let mut merged = existing.clone();
                for column in &schema.columns {
                    if !merged.has_column(column) {
                        merged.columns.push(column.clone());
                    }
                }
                if merged == *existing {
                    return Ok(false);
                }
                merged
            }
            None => schema.clone(),
        };
        self.commit(&mut state, StoreEntry::Schema(merged))?;
        Ok(true)
    }

    /// Adds a column to an existing table (a schema migration).
    ///
    /// Returns false if the column already existed.
    pub fn add_column(&self, table: &str, column: &str) -> CoreResult<bool> {
        let mut state = self.state.write();
        let mut schema = state
            .table(table)?
            .schema
            .clone()
            .ok_or_else(|| CoreError::unknown_table(table))?;
        if schema.has_column(column) {
            return Ok(false);
        }
        schema.columns.push(column.to_string());
        self.commit(&mut state, StoreEntry::Schema(schema))?;
        Ok(true)
    }

    /// Returns a table's schema.
    #[must_use]
    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.schema.clone())
    }

    fn check_columns(
        schema: &TableSchema,
        columns: &BTreeMap<String, String>,
    ) -> CoreResult<()> {
        for column in columns.keys() {
            if !schema.has_column(column) {
                return Err(CoreError::UnknownColumn {
                    table: schema.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    /// Inserts a new record.
    ///
    /// `mark_at` sets the dirty marker in the same journal entry.
    pub fn insert(
        &self,
        table: &str,
        id: RecordId,
        columns: BTreeMap<String, String>,
        mark_at: Option<Timestamp>,
    ) -> CoreResult<Record> {
        let mut state = self.state.write();
        let existing = state.table(table)?;
        if existing.records.contains_key(&id) {
            return Err(CoreError::RecordExists {
                table: table.to_string(),
                id,
            });
        }
        if let Some(schema) = &existing.schema {
            Self::check_columns(schema, &columns)?;
        }
        let prior_mark = existing.tombstones.get(&id).and_then(|t| t.dirty);

        let revision = state.next_sequence();
        let record = Record {
            id,
            columns,
            revision,
            dirty: prior_mark.or(mark_at.map(|at| DirtyMark { seq: revision, at })),
        };
        self.commit(
            &mut state,
            StoreEntry::Put {
                table: table.to_string(),
                record: record.clone(),
            },
        )?;
        Ok(record)
    }

    /// Updates columns of an existing record.
    ///
    /// Returns the record before and after the change.
    pub fn update(
        &self,
        table: &str,
        id: RecordId,
        changes: BTreeMap<String, String>,
        mark_at: Option<Timestamp>,
    ) -> CoreResult<(Record, Record)> {
        let mut state = self.state.write();
        let existing = state.table(table)?;
        if let Some(schema) = &existing.schema {
            Self::check_columns(schema, &changes)?;
        }
        let old = existing
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::RecordNotFound {
                table: table.to_string(),
                id,
            })?;

        let revision = state.next_sequence();
        let mut new = old.clone();
        new.columns.extend(changes);
        new.revision = revision;
        if new.dirty.is_none() {
            new.dirty = mark_at.map(|at| DirtyMark { seq: revision, at });
        }
        self.commit(
            &mut state,
            StoreEntry::Put {
                table: table.to_string(),
                record: new.clone(),
            },
        )?;
        Ok((old, new))
    }

    /// Deletes a record.
    ///
    /// With `keep_tombstone` the deletion is remembered until the next core
    /// rebuild. Returns the deleted record.
    pub fn delete(
        &self,
        table: &str,
        id: RecordId,
        keep_tombstone: bool,
        mark_at: Option<Timestamp>,
    ) -> CoreResult<Record> {
        let mut state = self.state.write();
        let old = state
            .table(table)?
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::RecordNotFound {
                table: table.to_string(),
                id,
            })?;

        let revision = state.next_sequence();
        let tombstone = keep_tombstone.then(|| Tombstone {
            id,
            revision,
            dirty: old.dirty.or(mark_at.map(|at| DirtyMark { seq: revision, at })),
        });
        self.commit(
            &mut state,
            StoreEntry::Delete {
                table: table.to_string(),
                id,
                tombstone,
            },
        )?;
        Ok(old)
    }

    /// Records a change that did not come through a mutation of this row,
    /// such as an associated row changing.
    ///
    /// The revision always advances. With `mark_at`, a clean record becomes
    /// dirty; an already-dirty record keeps its marker. Returns `None` if
    /// the record (or its tombstone) does not exist, otherwise whether a new
    /// marker was set.
    pub fn touch(
        &self,
        table: &str,
        id: RecordId,
        mark_at: Option<Timestamp>,
    ) -> CoreResult<Option<bool>> {
        let mut state = self.state.write();
        let existing = state.table(table)?;
        let current = match (existing.records.get(&id), existing.tombstones.get(&id)) {
            (Some(record), _) => record.dirty,
            (None, Some(tombstone)) => tombstone.dirty,
            (None, None) => return Ok(None),
        };

        let revision = state.next_sequence();
        let newly_marked = current.is_none() && mark_at.is_some();
        let dirty = current.or(mark_at.map(|at| DirtyMark { seq: revision, at }));
        self.commit(
            &mut state,
            StoreEntry::Touch {
                table: table.to_string(),
                id,
                revision,
                dirty,
            },
        )?;
        Ok(Some(newly_marked))
    }

    /// Clears dirty markers for records and purges tombstones that have not
    /// changed since `snapshot` was taken.
    pub fn clean(&self, table: &str, snapshot: &TableSnapshot) -> CoreResult<CleanOutcome> {
        let mut state = self.state.write();
        let current = state.table(table)?;
        let mut outcome = CleanOutcome::default();
        let mut cleared = Vec::new();
        let mut purged = Vec::new();

        for (id, seen) in &snapshot.records {
            if seen.dirty.is_none() {
                continue;
            }
            match current.records.get(id) {
                Some(now) if now.revision == seen.revision => cleared.push(*id),
                Some(_) => outcome.still_dirty += 1,
                None => {}
            }
        }
        for (id, seen) in &snapshot.tombstones {
            match current.tombstones.get(id) {
                Some(now) if now.revision == seen.revision => purged.push(*id),
                Some(_) => outcome.still_dirty += 1,
                None => {}
            }
        }

        outcome.cleared = cleared.len();
        outcome.purged = purged.len();
        if !cleared.is_empty() || !purged.is_empty() {
            self.commit(
                &mut state,
                StoreEntry::Clean {
                    table: table.to_string(),
                    cleared,
                    purged,
                },
            )?;
        }
        Ok(outcome)
    }

    /// Returns a record.
    #[must_use]
    pub fn get(&self, table: &str, id: RecordId) -> Option<Record> {
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.records.get(&id).cloned())
    }

    /// Returns a tombstone.
    #[must_use]
    pub fn tombstone(&self, table: &str, id: RecordId) -> Option<Tombstone> {
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.tombstones.get(&id).copied())
    }

    /// Returns the number of live records in a table.
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map_or(0, |t| t.records.len())
    }

    /// Returns the number of dirty records and tombstones in a table.
    #[must_use]
    pub fn dirty_count(&self, table: &str) -> usize {
        self.state.read().tables.get(table).map_or(0, |t| {
            t.records.values().filter(|r| r.is_dirty()).count()
                + t.tombstones.values().filter(|t| t.dirty.is_some()).count()
        })
    }

    /// Copies the given tables under a single read lock.
    pub fn snapshot(&self, tables: &[&str]) -> CoreResult<Snapshot> {
        let state = self.state.read();
        let mut snapshot = Snapshot {
            sequence: state.sequence,
            tables: HashMap::with_capacity(tables.len()),
        };
        for name in tables {
            let table = state.table(name)?;
            snapshot.tables.insert(
                (*name).to_string(),
                TableSnapshot {
                    records: table.records.clone(),
                    tombstones: table.tombstones.clone(),
                },
            );
        }
        Ok(snapshot)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RecordStore")
            .field("sequence", &state.sequence)
            .field("tables", &state.tables.len())
            .finish()
    }
}
