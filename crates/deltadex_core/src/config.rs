//! Engine and per-entity index configuration.
//!
//! Each indexed entity is declared with an [`EntityIndexConfig`]: the fields
//! to index and the [`DeltaStrategy`] that decides how changes reach the
//! delta segment. Configurations are serde types so the CLI can load them
//! from JSON:
//!
//! ```json
//! {
//!   "name": "articles",
//!   "delta": "datetime",
//!   "threshold_secs": 300,
//!   "fields": [
//!     { "name": "title", "from": "column", "column": "title" },
//!     { "name": "comments", "from": "association",
//!       "table": "comments", "foreign_key": "article_id", "column": "body" }
//!   ]
//! }
//! ```

use crate::error::{CoreError, CoreResult};
use crate::store::{RecordStore, TableSchema};
use crate::tokenizer::TokenizerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Dirty column used by flag-based strategies when none is configured.
pub const DEFAULT_FLAG_COLUMN: &str = "delta";

/// Dirty column used by the datetime strategy when none is configured.
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "updated_at";

/// How changes to an entity reach its delta segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum DeltaStrategy {
    /// No delta index; changes appear after the next core rebuild.
    None,
    /// Flag the record and rebuild the delta inline, before the mutation
    /// returns.
    #[serde(alias = "true")]
    Immediate,
    /// Timestamp the record; a periodic poll builds the delta once the
    /// mark is at least `threshold` old.
    Datetime {
        /// Settling time between a record being dirtied and it becoming
        /// eligible for a delta build.
        #[serde(rename = "threshold_secs", with = "duration_secs")]
        threshold: Duration,
    },
    /// Flag the record and enqueue a delta job for the worker.
    Delayed,
}

impl DeltaStrategy {
    /// Returns true if mutations set a dirty marker under this strategy.
    #[must_use]
    pub fn tracks_changes(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns the dirty column name used when none is configured.
    #[must_use]
    pub fn default_dirty_column(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Immediate | Self::Delayed => Some(DEFAULT_FLAG_COLUMN),
            Self::Datetime { .. } => Some(DEFAULT_TIMESTAMP_COLUMN),
        }
    }

    /// Short name used in logs and status output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Immediate => "immediate",
            Self::Datetime { .. } => "datetime",
            Self::Delayed => "delayed",
        }
    }
}

/// Where an indexed field takes its text from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum FieldSource {
    /// A column of the entity's own table.
    Column {
        /// Column name.
        column: String,
    },
    /// A column of every row in another table that points at the record
    /// through `foreign_key`. Values are joined with a space, in row order.
    Association {
        /// Associated table.
        table: String,
        /// Column of the associated table holding the owner's record ID.
        foreign_key: String,
        /// Column whose text is indexed.
        column: String,
    },
}

/// One indexed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name as seen by queries (`name:term`).
    pub name: String,
    /// Source of the field's text.
    #[serde(flatten)]
    pub source: FieldSource,
}

impl FieldSpec {
    /// A field read from the entity's own column of the same name.
    pub fn column(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: FieldSource::Column {
                column: name.clone(),
            },
            name,
        }
    }

    /// A field read from an associated table.
    pub fn association(
        name: impl Into<String>,
        table: impl Into<String>,
        foreign_key: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: FieldSource::Association {
                table: table.into(),
                foreign_key: foreign_key.into(),
                column: column.into(),
            },
        }
    }
}

/// Index declaration for one entity (one table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIndexConfig {
    /// Entity name; also the name of its table.
    pub name: String,
    /// Indexed fields.
    pub fields: Vec<FieldSpec>,
    /// Delta strategy.
    #[serde(flatten)]
    pub delta: DeltaStrategy,
    /// Column that holds the dirty marker. Defaults per strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty_column: Option<String>,
}

impl EntityIndexConfig {
    /// Creates a configuration with no fields and no delta.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            delta: DeltaStrategy::None,
            dirty_column: None,
        }
    }

    /// Adds an indexed field.
    #[must_use]
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the delta strategy.
    #[must_use]
    pub fn delta(mut self, strategy: DeltaStrategy) -> Self {
        self.delta = strategy;
        self
    }

    /// Overrides the dirty column name.
    #[must_use]
    pub fn dirty_column(mut self, column: impl Into<String>) -> Self {
        self.dirty_column = Some(column.into());
        self
    }

    /// Returns the dirty column in effect, if the strategy needs one.
    #[must_use]
    pub fn effective_dirty_column(&self) -> Option<&str> {
        if !self.delta.tracks_changes() {
            return None;
        }
        self.dirty_column
            .as_deref()
            .or_else(|| self.delta.default_dirty_column())
    }

    /// Tables read when building this entity's documents.
    #[must_use]
    pub fn source_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.name.as_str()];
        for field in &self.fields {
            if let FieldSource::Association { table, .. } = &field.source {
                if !tables.contains(&table.as_str()) {
                    tables.push(table);
                }
            }
        }
        tables
    }

    /// Checks the declaration against the current table schemas.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming this entity when a table,
    /// column or dirty column is missing, or the field list is malformed.
    pub fn validate(&self, store: &RecordStore) -> CoreResult<()> {
        let invalid = |message: String| CoreError::invalid_config(&self.name, message);

        let schema = store
            .schema(&self.name)
            .ok_or_else(|| invalid(format!("table {} does not exist", self.name)))?;

        if self.fields.is_empty() {
            return Err(invalid("no indexed fields declared".into()));
        }

        let mut names = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(invalid("field with an empty name".into()));
            }
            if field.name.contains(':') || field.name.chars().any(char::is_whitespace) {
                return Err(invalid(format!(
                    "field name {:?} may not contain ':' or whitespace",
                    field.name
                )));
            }
            if !names.insert(field.name.as_str()) {
                return Err(invalid(format!("field {} declared twice", field.name)));
            }

            match &field.source {
                FieldSource::Column { column } => {
                    require_column(&schema, column).map_err(invalid)?;
                }
                FieldSource::Association {
                    table,
                    foreign_key,
                    column,
                } => {
                    let assoc = store.schema(table).ok_or_else(|| {
                        invalid(format!(
                            "field {} references missing table {table}",
                            field.name
                        ))
                    })?;
                    require_column(&assoc, foreign_key).map_err(invalid)?;
                    require_column(&assoc, column).map_err(invalid)?;
                }
            }
        }

        if let Some(dirty) = self.effective_dirty_column() {
            if !schema.has_column(dirty) {
                return Err(invalid(format!(
                    "{} delta needs dirty column {dirty}; add it with a migration",
                    self.delta.label()
                )));
            }
        }

        Ok(())
    }
}

fn require_column(schema: &TableSchema, column: &str) -> Result<(), String> {
    if schema.has_column(column) {
        Ok(())
    } else {
        Err(format!("table {} has no column {column}", schema.name))
    }
}

/// Options passed explicitly to every index build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Suppress indexer output (logged at `trace` instead of `info`).
    pub quiet: bool,
    /// Tokenizer used for documents and stored in each segment for queries.
    pub tokenizer: TokenizerConfig,
}

impl BuildOptions {
    /// Returns a copy with the quiet switch set.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

/// Settings for the delta worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,
    /// Whether each worker tick also runs the datetime threshold poll.
    pub poll_thresholds: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_thresholds: true,
        }
    }
}

/// Configuration for opening an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Table schemas created (or extended) on open.
    pub tables: Vec<TableSchema>,
    /// Indexed entities.
    pub entities: Vec<EntityIndexConfig>,
    /// Default build options.
    pub build: BuildOptions,
    /// Worker loop settings.
    pub worker: WorkerConfig,
    /// Number of finished jobs kept in the journal before it is compacted.
    pub compact_journal_after: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            entities: Vec::new(),
            build: BuildOptions::default(),
            worker: WorkerConfig::default(),
            compact_journal_after: 1024,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table schema.
    #[must_use]
    pub fn table(mut self, schema: TableSchema) -> Self {
        self.tables.push(schema);
        self
    }

    /// Adds an indexed entity.
    #[must_use]
    pub fn entity(mut self, entity: EntityIndexConfig) -> Self {
        self.entities.push(entity);
        self
    }

    /// Sets the default quiet switch for builds.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.build.quiet = quiet;
        self
    }

    /// Sets the tokenizer used for builds.
    #[must_use]
    pub fn tokenizer(mut self, tokenizer: TokenizerConfig) -> Self {
        self.build.tokenizer = tokenizer;
        self
    }

    /// Sets the worker poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    /// Sets the journal compaction threshold.
    #[must_use]
    pub fn compact_journal_after(mut self, finished_jobs: usize) -> Self {
        self.compact_journal_after = finished_jobs;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog_store() -> RecordStore {
        let store = RecordStore::new();
        store
            .ensure_table(&TableSchema::new("articles", &["title", "body", "delta"]))
            .unwrap();
        store
            .ensure_table(&TableSchema::new("comments", &["article_id", "body"]))
            .unwrap();
        store
    }

    fn articles() -> EntityIndexConfig {
        EntityIndexConfig::new("articles")
            .field(FieldSpec::column("title"))
            .field(FieldSpec::association(
                "comments",
                "comments",
                "article_id",
                "body",
            ))
            .delta(DeltaStrategy::Immediate)
    }

    #[test]
    fn valid_config_passes() {
        assert!(articles().validate(&blog_store()).is_ok());
    }

    #[test]
    fn missing_dirty_column_is_rejected() {
        let config = articles().delta(DeltaStrategy::Datetime {
            threshold: Duration::from_secs(60),
        });
        let err = config.validate(&blog_store()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { ref entity, .. } if entity == "articles"));
        assert!(err.to_string().contains("updated_at"));
    }

    #[test]
    fn no_delta_needs_no_dirty_column() {
        let config = articles().delta(DeltaStrategy::None);
        assert_eq!(config.effective_dirty_column(), None);
        assert!(config.validate(&blog_store()).is_ok());
    }

    #[test]
    fn malformed_fields_are_rejected() {
        let store = blog_store();
        let duplicate = articles().field(FieldSpec::column("title"));
        assert!(duplicate.validate(&store).is_err());

        let unknown = EntityIndexConfig::new("articles").field(FieldSpec::column("summary"));
        assert!(unknown.validate(&store).is_err());

        let empty = EntityIndexConfig::new("articles");
        assert!(empty.validate(&store).is_err());

        let colon = EntityIndexConfig::new("articles").field(FieldSpec {
            name: "a:b".into(),
            source: FieldSource::Column {
                column: "title".into(),
            },
        });
        assert!(colon.validate(&store).is_err());
    }

    #[test]
    fn source_tables_lists_associations_once() {
        let config = articles().field(FieldSpec::association(
            "authors",
            "comments",
            "article_id",
            "body",
        ));
        assert_eq!(config.source_tables(), vec!["articles", "comments"]);
    }

    #[test]
    fn strategy_json_forms() {
        let immediate: EntityIndexConfig = serde_json::from_str(
            r#"{"name":"a","delta":"true","fields":[{"name":"t","from":"column","column":"t"}]}"#,
        )
        .unwrap();
        assert_eq!(immediate.delta, DeltaStrategy::Immediate);

        let datetime: EntityIndexConfig = serde_json::from_str(
            r#"{"name":"a","delta":"datetime","threshold_secs":90,"fields":[]}"#,
        )
        .unwrap();
        assert_eq!(
            datetime.delta,
            DeltaStrategy::Datetime {
                threshold: Duration::from_secs(90)
            }
        );

        let delayed: EntityIndexConfig =
            serde_json::from_str(r#"{"name":"a","delta":"delayed","fields":[]}"#).unwrap();
        assert_eq!(delayed.delta, DeltaStrategy::Delayed);
    }

    #[test]
    fn engine_config_defaults_and_builder() {
        let config = EngineConfig::new()
            .quiet(true)
            .poll_interval(Duration::from_millis(50))
            .compact_journal_after(8);
        assert!(config.build.quiet);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(50));
        assert_eq!(config.compact_journal_after, 8);
        assert!(EngineConfig::default().worker.poll_thresholds);
    }
}
