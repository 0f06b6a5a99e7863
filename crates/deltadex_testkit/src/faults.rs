//! Fault injection.
//!
//! - [`FailingIndexer`] fails builds on demand, for testing that a failed
//!   build never disturbs the served segment.
//! - [`TornBackend`] stops writing after a byte budget, leaving a torn
//!   frame behind like a crash mid-append.
//! - [`FlakyBackend`] fails size lookups on demand, like a transient I/O
//!   error on a shared log.
//! - [`corrupt_segment`] overwrites a persisted segment file.

use deltadex_core::{
    BuildOutput, BuildRequest, CoreError, CoreResult, IndexDir, Indexer, NativeIndexer,
    SegmentKind,
};
use deltadex_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An indexer that delegates to [`NativeIndexer`] unless told to fail.
#[derive(Debug, Default)]
pub struct FailingIndexer {
    failing: AtomicBool,
    builds: AtomicUsize,
    failures: AtomicUsize,
}

impl FailingIndexer {
    /// Creates an indexer that succeeds until [`FailingIndexer::set_failing`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following build fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful builds.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of failed builds.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Indexer for FailingIndexer {
    fn build(&self, request: BuildRequest<'_>) -> CoreResult<BuildOutput> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::build_failed(
                &request.entity.name,
                request.kind,
                "injected indexer failure",
            ));
        }
        let output = NativeIndexer.build(request)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(output)
    }
}

/// A backend over a shared in-memory buffer that crashes once a byte
/// budget is spent.
///
/// The append that crosses the budget writes only the bytes that fit and
/// then fails. Every later append fails outright.
#[derive(Debug, Clone)]
pub struct TornBackend {
    inner: InMemoryBackend,
    budget: Arc<AtomicUsize>,
}

impl TornBackend {
    /// Wraps `inner`, allowing `budget` more bytes to be appended.
    pub fn new(inner: InMemoryBackend, budget: usize) -> Self {
        Self {
            inner,
            budget: Arc::new(AtomicUsize::new(budget)),
        }
    }

    /// Returns the shared buffer, for reopening after the crash.
    pub fn inner(&self) -> InMemoryBackend {
        self.inner.clone()
    }

    fn crash(message: &str) -> StorageError {
        StorageError::Io(std::io::Error::other(message.to_string()))
    }
}

impl StorageBackend for TornBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let budget = self.budget.load(Ordering::SeqCst);
        if data.len() <= budget {
            self.budget.fetch_sub(data.len(), Ordering::SeqCst);
            return self.inner.append(data);
        }
        self.budget.store(0, Ordering::SeqCst);
        if budget > 0 {
            self.inner.append(&data[..budget])?;
            return Err(Self::crash("simulated crash during partial write"));
        }
        Err(Self::crash("simulated crash during write"))
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// A backend over a shared in-memory buffer whose `refresh` can be made to
/// fail a given number of times.
#[derive(Debug, Clone, Default)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    failures: Arc<AtomicUsize>,
}

impl FlakyBackend {
    /// Wraps `inner`.
    pub fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `count` refreshes fail, on this handle and its clones.
    pub fn fail_next_refreshes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl StorageBackend for FlakyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn refresh(&mut self) -> StorageResult<u64> {
        let pending = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(StorageError::Io(std::io::Error::other("transient I/O error")));
        }
        self.inner.refresh()
    }
}

/// Overwrites a persisted segment file with bytes that do not decode.
pub fn corrupt_segment(dir: &IndexDir, entity: &str, kind: SegmentKind) -> CoreResult<()> {
    dir.write_segment(entity, kind, b"not a segment")
}
