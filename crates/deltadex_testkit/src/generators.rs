//! Property-based test generators using proptest.
//!
//! Mutation scripts reference a small ID space so inserts, updates and
//! deletes collide often. [`Mutation::apply`] turns a script step into an
//! engine call, skipping steps that do not fit the current state (updating
//! a missing record, inserting an existing one), and [`Model`] tracks what a
//! search must return after everything is indexed.

use crate::fixtures::{columns, ARTICLES};
use deltadex_core::{CoreResult, DeltaStrategy, Engine, RecordId};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

/// Strategy for one lowercase word.
pub fn word_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{3,8}").expect("Invalid regex")
}

/// Strategy for a short title of one to four words.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(word_strategy(), 1..5).prop_map(|words| words.join(" "))
}

/// Strategy for delta strategies that track changes.
pub fn tracking_strategy() -> impl Strategy<Value = DeltaStrategy> {
    prop_oneof![
        Just(DeltaStrategy::Immediate),
        Just(DeltaStrategy::Delayed),
        (1u64..120).prop_map(|secs| DeltaStrategy::Datetime {
            threshold: Duration::from_secs(secs)
        }),
    ]
}

/// One step of a mutation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert an article.
    Insert {
        /// Article ID.
        id: u64,
        /// Title.
        title: String,
    },
    /// Change an article's title.
    Update {
        /// Article ID.
        id: u64,
        /// New title.
        title: String,
    },
    /// Delete an article.
    Delete {
        /// Article ID.
        id: u64,
    },
}

impl Mutation {
    /// Applies the step to the engine and the model.
    ///
    /// Returns false if the step was skipped.
    pub fn apply(&self, engine: &Engine, model: &mut Model) -> CoreResult<bool> {
        match self {
            Self::Insert { id, title } => {
                if model.titles.contains_key(id) {
                    return Ok(false);
                }
                engine.insert(ARTICLES, RecordId::new(*id), columns(&[("title", title)]))?;
                model.titles.insert(*id, title.clone());
            }
            Self::Update { id, title } => {
                if !model.titles.contains_key(id) {
                    return Ok(false);
                }
                engine.update(ARTICLES, RecordId::new(*id), columns(&[("title", title)]))?;
                model.titles.insert(*id, title.clone());
            }
            Self::Delete { id } => {
                if model.titles.remove(id).is_none() {
                    return Ok(false);
                }
                engine.delete(ARTICLES, RecordId::new(*id))?;
            }
        }
        Ok(true)
    }
}

/// Expected article titles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    /// Live articles by ID.
    pub titles: BTreeMap<u64, String>,
}

impl Model {
    /// IDs whose title contains `word` as a whole word.
    pub fn matching(&self, word: &str) -> Vec<u64> {
        self.titles
            .iter()
            .filter(|(_, title)| title.split(' ').any(|w| w == word))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Every distinct word a script ever wrote, including words whose records
/// were later changed or deleted.
pub fn probe_words(script: &[Mutation]) -> Vec<&str> {
    let mut words: Vec<&str> = script
        .iter()
        .filter_map(|m| match m {
            Mutation::Insert { title, .. } | Mutation::Update { title, .. } => Some(title),
            Mutation::Delete { .. } => None,
        })
        .flat_map(|title| title.split(' '))
        .collect();
    words.sort_unstable();
    words.dedup();
    words
}

/// Strategy for one mutation over IDs `1..=max_id`.
pub fn mutation_strategy(max_id: u64) -> impl Strategy<Value = Mutation> {
    prop_oneof![
        3 => (1..=max_id, title_strategy()).prop_map(|(id, title)| Mutation::Insert { id, title }),
        2 => (1..=max_id, title_strategy()).prop_map(|(id, title)| Mutation::Update { id, title }),
        1 => (1..=max_id).prop_map(|id| Mutation::Delete { id }),
    ]
}

/// Strategy for a mutation script.
pub fn script_strategy(max_id: u64, len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(mutation_strategy(max_id), 1..=len)
}
