//! Index directory management.
//!
//! This module handles the file system layout of a deltadex directory:
//!
//! ```text
//! <path>/
//! ├─ LOCK                      # Advisory lock held around log appends
//! ├─ WORKER.lock               # Advisory lock held by the running worker
//! ├─ records.log               # Record mutation log
//! ├─ jobs.log                  # Build job journal
//! └─ segments/
//!    ├─ <entity>.core.seg
//!    └─ <entity>.delta.seg
//! ```
//!
//! Several processes may open the same directory (CLI commands next to a
//! running worker). Log writers serialize on `LOCK` and catch up with the
//! log before appending; see [`IndexDir::lock`].

use crate::error::{CoreError, CoreResult};
use crate::segment::SegmentKind;
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File names within the directory.
const LOCK_FILE: &str = "LOCK";
const WORKER_LOCK_FILE: &str = "WORKER.lock";
const RECORDS_FILE: &str = "records.log";
const JOBS_FILE: &str = "jobs.log";
const SEGMENTS_DIR: &str = "segments";

/// Layout of a deltadex directory.
#[derive(Debug, Clone)]
pub struct IndexDir {
    path: PathBuf,
}

/// Exclusive hold on the directory's `LOCK` file. Released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Exclusive hold on `WORKER.lock`, held for the worker's lifetime.
#[derive(Debug)]
pub struct WorkerLease {
    _file: File,
}

impl IndexDir {
    /// Opens or creates a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the path exists but is not a directory, or on
    /// I/O failure.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }
        fs::create_dir_all(path.join(SEGMENTS_DIR))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the record mutation log.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.path.join(RECORDS_FILE)
    }

    /// Returns the path to the job journal.
    #[must_use]
    pub fn jobs_path(&self) -> PathBuf {
        self.path.join(JOBS_FILE)
    }

    /// Returns the path to the segments directory.
    #[must_use]
    pub fn segments_dir(&self) -> PathBuf {
        self.path.join(SEGMENTS_DIR)
    }

    /// Returns the path to an entity's segment file.
    #[must_use]
    pub fn segment_path(&self, entity: &str, kind: SegmentKind) -> PathBuf {
        self.segments_dir().join(format!("{entity}.{kind}.seg"))
    }

    /// Blocks until the directory's `LOCK` is held exclusively.
    ///
    /// The lock is per open file, so it also serializes threads of one
    /// process. It must not be taken twice by the same thread.
    pub fn lock(&self) -> CoreResult<DirLock> {
        let file = open_lock_file(&self.path.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(DirLock { file })
    }

    /// Takes the worker lease without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WorkerLocked`] if another worker holds it.
    pub fn worker_lease(&self) -> CoreResult<WorkerLease> {
        let file = open_lock_file(&self.path.join(WORKER_LOCK_FILE))?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::WorkerLocked);
        }
        Ok(WorkerLease { _file: file })
    }

    /// Reads a segment file. Returns `None` if it does not exist.
    pub fn read_segment(&self, entity: &str, kind: SegmentKind) -> CoreResult<Option<Vec<u8>>> {
        let path = self.segment_path(entity, kind);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Returns the modification time of a segment file, if it exists.
    pub fn segment_modified(&self, entity: &str, kind: SegmentKind) -> CoreResult<Option<SystemTime>> {
        match fs::metadata(self.segment_path(entity, kind)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a segment file atomically.
    ///
    /// 1. Write to a temporary file
    /// 2. Sync the temporary file
    /// 3. Rename it over the segment file
    /// 4. Sync the segments directory
    ///
    /// Readers see either the old file or the new one.
    pub fn write_segment(&self, entity: &str, kind: SegmentKind, data: &[u8]) -> CoreResult<()> {
        let path = self.segment_path(entity, kind);
        let temp = self
            .segments_dir()
            .join(format!("{entity}.{kind}.seg.{}.tmp", std::process::id()));

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        self.sync_segments_directory()?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_segments_directory(&self) -> CoreResult<()> {
        File::open(self.segments_dir())?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_segments_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Serializes log writers within this process and, with a directory,
/// across processes.
#[derive(Debug, Default)]
pub(crate) struct LogGate {
    dir: Option<IndexDir>,
    local: Mutex<()>,
}

/// Held while appending to the logs.
pub(crate) struct LogGuard<'a> {
    _dir: Option<DirLock>,
    _local: MutexGuard<'a, ()>,
}

impl LogGate {
    pub(crate) fn new(dir: Option<IndexDir>) -> Self {
        Self {
            dir,
            local: Mutex::new(()),
        }
    }

    /// Takes the gate. Not reentrant.
    pub(crate) fn hold(&self) -> CoreResult<LogGuard<'_>> {
        let local = self.local.lock();
        let dir = self.dir.as_ref().map(IndexDir::lock).transpose()?;
        Ok(LogGuard {
            _dir: dir,
            _local: local,
        })
    }
}

fn open_lock_file(path: &Path) -> CoreResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}
