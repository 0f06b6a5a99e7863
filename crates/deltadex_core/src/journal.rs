//! Framed, checksummed append-only logs.
//!
//! The record store and the job queue both persist their changes as a
//! sequence of CBOR-encoded entries on a [`StorageBackend`].
//!
//! ## Frame Format
//!
//! ```text
//! | payload_len (4) | crc32 (4) | payload (N) |
//! ```
//!
//! The CRC covers the payload only. A frame whose length runs past the end of
//! the log is a torn tail (a crash mid-append, or another process mid-write)
//! and is left unread until it completes.

use crate::error::{CoreError, CoreResult};
use deltadex_storage::StorageBackend;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Encodes a value as CBOR.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR.
pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

/// An append-only log of CBOR entries.
///
/// The journal remembers how far it has read. Entries appended through this
/// handle are considered read; entries appended by other handles are picked
/// up by [`Journal::read_new`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    read_offset: u64,
}

impl Journal {
    /// Wraps a backend. Nothing is read until [`Journal::read_new`].
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            read_offset: 0,
        }
    }

    /// Returns true if the log is now shorter than what was already read,
    /// which happens when another handle rewrote it.
    pub fn is_truncated(&mut self) -> CoreResult<bool> {
        Ok(self.backend.refresh()? < self.read_offset)
    }

    /// Forgets the read position so the next [`Journal::read_new`] starts
    /// from the beginning.
    pub fn reset(&mut self) {
        self.read_offset = 0;
    }

    /// Reads every complete entry past the read offset.
    pub fn read_new<T: DeserializeOwned>(&mut self) -> CoreResult<Vec<T>> {
        let size = self.backend.refresh()?;
        if size < self.read_offset {
            return Err(CoreError::log_corruption(format!(
                "log shrank from {} to {size} bytes",
                self.read_offset
            )));
        }
        let mut entries = Vec::new();
        let mut offset = self.read_offset;

        while offset + FRAME_HEADER_SIZE as u64 <= size {
            let header = self.backend.read_at(offset, FRAME_HEADER_SIZE)?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let payload_start = offset + FRAME_HEADER_SIZE as u64;
            if payload_start + len as u64 > size {
                break;
            }

            let payload = self.backend.read_at(payload_start, len)?;
            let actual = crc32fast::hash(&payload);
            if actual != stored_crc {
                return Err(CoreError::ChecksumMismatch {
                    expected: stored_crc,
                    actual,
                });
            }

            entries.push(from_cbor(&payload)?);
            offset = payload_start + len as u64;
        }

        self.read_offset = offset;
        Ok(entries)
    }

    /// Cuts off a torn tail left by a writer that crashed mid-append.
    ///
    /// Only safe while no other handle can be appending, i.e. under the
    /// directory lock. Returns the number of bytes removed.
    pub fn truncate_torn_tail(&mut self) -> CoreResult<u64> {
        let size = self.backend.refresh()?;
        if size <= self.read_offset {
            return Ok(0);
        }
        self.backend.truncate(self.read_offset)?;
        self.backend.sync()?;
        Ok(size - self.read_offset)
    }

    /// Appends entries as one write and flushes.
    ///
    /// The caller must have consumed every foreign entry first (see
    /// [`Journal::read_new`]), otherwise those entries would be skipped.
    pub fn append<T: Serialize>(&mut self, entries: &[T]) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let size = self.backend.refresh()?;
        if size != self.read_offset {
            return Err(CoreError::log_corruption(format!(
                "{} unread bytes before append",
                size.saturating_sub(self.read_offset)
            )));
        }

        let mut buf = Vec::new();
        for entry in entries {
            let payload = to_cbor(entry)?;
            let len = u32::try_from(payload.len())
                .map_err(|_| CoreError::codec("log entry exceeds 4 GiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }

        let offset = self.backend.append(&buf)?;
        self.backend.flush()?;
        self.read_offset = offset + buf.len() as u64;
        Ok(())
    }

    /// Replaces the whole log with `entries`.
    pub fn rewrite<T: Serialize>(&mut self, entries: &[T]) -> CoreResult<()> {
        self.backend.refresh()?;
        self.backend.truncate(0)?;
        self.read_offset = 0;
        self.append(entries)?;
        self.backend.sync()?;
        Ok(())
    }

}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("read_offset", &self.read_offset)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltadex_storage::InMemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Put(u64, String),
        Drop(u64),
    }

    #[test]
    fn append_then_reopen_reads_everything() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::new(Box::new(backend.clone()));
        journal
            .append(&[Entry::Put(1, "a".into()), Entry::Drop(1)])
            .unwrap();

        let mut reopened = Journal::new(Box::new(backend));
        let entries: Vec<Entry> = reopened.read_new().unwrap();
        assert_eq!(entries, vec![Entry::Put(1, "a".into()), Entry::Drop(1)]);
        assert!(reopened.read_new::<Entry>().unwrap().is_empty());
    }

    #[test]
    fn own_appends_are_not_read_back() {
        let mut journal = Journal::new(Box::new(InMemoryBackend::new()));
        journal.append(&[Entry::Drop(9)]).unwrap();
        assert!(journal.read_new::<Entry>().unwrap().is_empty());
    }

    #[test]
    fn foreign_appends_block_until_read() {
        let backend = InMemoryBackend::new();
        let mut mine = Journal::new(Box::new(backend.clone()));
        let mut theirs = Journal::new(Box::new(backend));

        theirs.append(&[Entry::Drop(1)]).unwrap();
        assert!(matches!(
            mine.append(&[Entry::Drop(2)]),
            Err(CoreError::LogCorruption { .. })
        ));

        assert_eq!(mine.read_new::<Entry>().unwrap(), vec![Entry::Drop(1)]);
        mine.append(&[Entry::Drop(2)]).unwrap();
        assert_eq!(theirs.read_new::<Entry>().unwrap(), vec![Entry::Drop(2)]);
    }

    #[test]
    fn torn_tail_is_left_unread() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::new(Box::new(backend.clone()));
        journal.append(&[Entry::Drop(1), Entry::Drop(2)]).unwrap();

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 1);
        let mut torn = Journal::new(Box::new(InMemoryBackend::with_data(bytes)));
        assert_eq!(torn.read_new::<Entry>().unwrap(), vec![Entry::Drop(1)]);
    }

    #[test]
    fn torn_tail_can_be_cut_off_and_appended_past() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::new(Box::new(backend.clone()));
        journal.append(&[Entry::Drop(1), Entry::Drop(2)]).unwrap();

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 1);
        let torn = InMemoryBackend::with_data(bytes);
        let mut recovered = Journal::new(Box::new(torn.clone()));
        recovered.read_new::<Entry>().unwrap();
        assert!(recovered.truncate_torn_tail().unwrap() > 0);
        recovered.append(&[Entry::Drop(3)]).unwrap();

        let mut reopened = Journal::new(Box::new(torn));
        assert_eq!(
            reopened.read_new::<Entry>().unwrap(),
            vec![Entry::Drop(1), Entry::Drop(3)]
        );
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::new(Box::new(backend.clone()));
        journal.append(&[Entry::Put(1, "payload".into())]).unwrap();

        let mut bytes = backend.data();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut corrupted = Journal::new(Box::new(InMemoryBackend::with_data(bytes)));
        assert!(matches!(
            corrupted.read_new::<Entry>(),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rewrite_is_seen_as_truncation_by_other_handles() {
        let backend = InMemoryBackend::new();
        let mut writer = Journal::new(Box::new(backend.clone()));
        let mut reader = Journal::new(Box::new(backend));
        writer
            .append(&[Entry::Put(1, "long enough".into()), Entry::Drop(1)])
            .unwrap();
        reader.read_new::<Entry>().unwrap();

        writer.rewrite(&[Entry::Drop(2)]).unwrap();
        assert!(reader.is_truncated().unwrap());
        reader.reset();
        assert_eq!(reader.read_new::<Entry>().unwrap(), vec![Entry::Drop(2)]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::new(Box::new(backend.clone()));
        journal
            .append(&[Entry::Drop(1), Entry::Drop(2), Entry::Drop(3)])
            .unwrap();
        journal.rewrite(&[Entry::Drop(3)]).unwrap();

        let mut reopened = Journal::new(Box::new(backend));
        assert_eq!(reopened.read_new::<Entry>().unwrap(), vec![Entry::Drop(3)]);
    }
}
