//! Dirty tracking decisions.
//!
//! The tracker knows which tables feed which entities. For a mutation it
//! answers two questions: does the mutated row itself need a dirty marker
//! (and what happens next, see [`DeltaAction`]), and which owner records of
//! other entities index this row through an association field.

use crate::config::{DeltaStrategy, EntityIndexConfig, FieldSource};
use crate::store::Record;
use crate::types::{RecordId, Timestamp};
use std::collections::{BTreeSet, HashMap};

/// What follows once a record has been marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaAction {
    /// The entity has no delta; the change waits for the next core rebuild.
    None,
    /// Build the delta now, before the mutation returns.
    BuildNow,
    /// Leave it to the threshold poller.
    AwaitThreshold,
    /// Enqueue a delta job for the worker.
    Enqueue,
}

impl DeltaAction {
    /// The action a strategy calls for.
    #[must_use]
    pub fn for_strategy(strategy: &DeltaStrategy) -> Self {
        match strategy {
            DeltaStrategy::None => Self::None,
            DeltaStrategy::Immediate => Self::BuildNow,
            DeltaStrategy::Datetime { .. } => Self::AwaitThreshold,
            DeltaStrategy::Delayed => Self::Enqueue,
        }
    }
}

#[derive(Debug, Clone)]
struct Dependency {
    owner: String,
    foreign_key: String,
}

/// Maps tables to the entities they feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    entities: HashMap<String, EntityIndexConfig>,
    dependents: HashMap<String, Vec<Dependency>>,
}

impl ChangeTracker {
    /// Builds a tracker over the enabled entities.
    #[must_use]
    pub fn new<'a>(entities: impl IntoIterator<Item = &'a EntityIndexConfig>) -> Self {
        let mut tracker = Self::default();
        for entity in entities {
            for field in &entity.fields {
                if let FieldSource::Association {
                    table, foreign_key, ..
                } = &field.source
                {
                    let deps = tracker.dependents.entry(table.clone()).or_default();
                    let exists = deps
                        .iter()
                        .any(|d| d.owner == entity.name && d.foreign_key == *foreign_key);
                    if !exists {
                        deps.push(Dependency {
                            owner: entity.name.clone(),
                            foreign_key: foreign_key.clone(),
                        });
                    }
                }
            }
            tracker
                .entities
                .insert(entity.name.clone(), entity.clone());
        }
        tracker
    }

    /// Returns the enabled entity indexing `table`, if any.
    #[must_use]
    pub fn entity(&self, table: &str) -> Option<&EntityIndexConfig> {
        self.entities.get(table)
    }

    /// Returns the action for a change to a record of `entity`.
    #[must_use]
    pub fn action(&self, entity: &str) -> DeltaAction {
        self.entities
            .get(entity)
            .map_or(DeltaAction::None, |e| DeltaAction::for_strategy(&e.delta))
    }

    /// Returns the dirty marker time for a change at `now`, or `None` if
    /// changes to the table are not tracked.
    #[must_use]
    pub fn mark_time(&self, table: &str, now: Timestamp) -> Option<Timestamp> {
        self.entities
            .get(table)
            .filter(|e| e.delta.tracks_changes())
            .map(|_| now)
    }

    /// Returns true if deletions from `table` must leave a tombstone.
    #[must_use]
    pub fn keeps_tombstones(&self, table: &str) -> bool {
        self.entities.contains_key(table)
    }

    /// Owner records whose documents include a changed row of `table`.
    ///
    /// Both the owner referenced before the change and the one referenced
    /// after it are returned, so moving a row between owners dirties both.
    /// Results are deduplicated and ordered.
    #[must_use]
    pub fn owners_affected(
        &self,
        table: &str,
        old: Option<&Record>,
        new: Option<&Record>,
    ) -> Vec<(String, RecordId)> {
        let Some(deps) = self.dependents.get(table) else {
            return Vec::new();
        };
        let mut owners = BTreeSet::new();
        for dep in deps {
            for row in [old, new].into_iter().flatten() {
                if let Some(id) = row.get(&dep.foreign_key).and_then(RecordId::parse) {
                    owners.insert((dep.owner.clone(), id));
                }
            }
        }
        owners.into_iter().collect()
    }
}
