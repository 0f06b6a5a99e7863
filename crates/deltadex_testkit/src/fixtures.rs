//! Test fixtures and engine helpers.
//!
//! The fixture schema is a small blog: `articles` (indexed, with `title`,
//! `body` and a `comments` association field) and `comments` (not indexed,
//! pointing at articles through `article_id`).

use deltadex_core::{
    DeltaStrategy, Engine, EngineConfig, EntityIndexConfig, FieldSpec, Indexer, ManualClock,
    MutationReport, RecordId, SearchResult, TableSchema, Timestamp,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Indexed entity of the fixture schema.
pub const ARTICLES: &str = "articles";

/// Association table of the fixture schema.
pub const COMMENTS: &str = "comments";

/// Start time of the fixture clock.
pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Builds a column map from pairs.
pub fn columns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(column, value)| ((*column).to_string(), (*value).to_string()))
        .collect()
}

/// The blog configuration with the given strategy on `articles`.
pub fn blog_config(strategy: DeltaStrategy) -> EngineConfig {
    EngineConfig::new()
        .table(TableSchema::new(
            ARTICLES,
            &["title", "body", "delta", "updated_at"],
        ))
        .table(TableSchema::new(COMMENTS, &["article_id", "body"]))
        .entity(
            EntityIndexConfig::new(ARTICLES)
                .field(FieldSpec::column("title"))
                .field(FieldSpec::column("body"))
                .field(FieldSpec::association(
                    "comments",
                    COMMENTS,
                    "article_id",
                    "body",
                ))
                .delta(strategy),
        )
        .quiet(true)
}

/// An engine over the blog schema with a manual clock.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Arc<Engine>,
    /// The clock the engine reads.
    pub clock: Arc<ManualClock>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an in-memory engine.
    pub fn memory(strategy: DeltaStrategy) -> Self {
        Self::build(blog_config(strategy), None, None)
    }

    /// Creates an in-memory engine with a custom indexer.
    pub fn with_indexer(strategy: DeltaStrategy, indexer: Arc<dyn Indexer>) -> Self {
        Self::build(blog_config(strategy), None, Some(indexer))
    }

    /// Creates an engine persisted in a fresh temporary directory.
    pub fn file(strategy: DeltaStrategy) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::build(blog_config(strategy), Some(temp_dir), None)
    }

    /// Creates an engine from an arbitrary configuration.
    pub fn from_config(config: EngineConfig) -> Self {
        Self::build(config, None, None)
    }

    fn build(config: EngineConfig, temp_dir: Option<TempDir>, indexer: Option<Arc<dyn Indexer>>) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let mut builder = Engine::builder(config).clock(clock.clone());
        if let Some(dir) = &temp_dir {
            builder = builder.path(dir.path());
        }
        if let Some(indexer) = indexer {
            builder = builder.indexer(indexer);
        }
        Self {
            engine: Arc::new(builder.build().expect("Failed to open engine")),
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the directory of a file-based engine.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Opens a second engine over the same directory, sharing the clock.
    pub fn open_again(&self) -> Arc<Engine> {
        let path = self.path().expect("open_again needs a file-based engine");
        Arc::new(
            Engine::builder(self.engine.config().clone())
                .path(path)
                .clock(self.clock.clone())
                .build()
                .expect("Failed to reopen engine"),
        )
    }

    /// Inserts an article.
    pub fn insert_article(&self, id: u64, title: &str, body: &str) -> MutationReport {
        self.engine
            .insert(
                ARTICLES,
                RecordId::new(id),
                columns(&[("title", title), ("body", body)]),
            )
            .expect("Failed to insert article")
    }

    /// Changes an article's title.
    pub fn retitle(&self, id: u64, title: &str) -> MutationReport {
        self.engine
            .update(ARTICLES, RecordId::new(id), columns(&[("title", title)]))
            .expect("Failed to update article")
    }

    /// Inserts a comment on an article.
    pub fn comment(&self, id: u64, article: u64, body: &str) -> MutationReport {
        let article = article.to_string();
        self.engine
            .insert(
                COMMENTS,
                RecordId::new(id),
                columns(&[("article_id", &article), ("body", body)]),
            )
            .expect("Failed to insert comment")
    }

    /// Searches articles.
    pub fn search(&self, query: &str) -> SearchResult {
        self.engine
            .search(ARTICLES, query)
            .expect("Search failed")
    }

    /// Searches articles and returns the matching IDs.
    pub fn search_ids(&self, query: &str) -> Vec<u64> {
        self.search(query)
            .ids()
            .into_iter()
            .map(RecordId::as_u64)
            .collect()
    }

    /// Returns true if the article carries a dirty marker.
    pub fn is_dirty(&self, id: u64) -> bool {
        self.engine
            .get(ARTICLES, RecordId::new(id))
            .is_some_and(|record| record.is_dirty())
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs a test with an in-memory blog engine.
///
/// # Example
///
/// ```rust,ignore
/// use deltadex_testkit::with_engine;
///
/// #[test]
/// fn my_test() {
///     with_engine(DeltaStrategy::Immediate, |t| {
///         t.insert_article(1, "hello", "");
///     });
/// }
/// ```
pub fn with_engine<F, R>(strategy: DeltaStrategy, f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory(strategy);
    f(&engine)
}
