//! # deltadex storage
//!
//! Byte-store backends used by deltadex for its append-only logs
//! (record mutations, build-job journal).
//!
//! Backends are **opaque**: they read, append, flush and truncate bytes and
//! know nothing about log framing or segment formats. `deltadex_core` owns
//! every format built on top of them.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral engines
//! - [`FileBackend`] - Persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use deltadex_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"job queued").unwrap();
//! let data = backend.read_at(offset, 10).unwrap();
//! assert_eq!(&data, b"job queued");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
