use std::future::Future;

use bytes::Bytes;

use crate::error::Result;
use crate::reader::ReadProgress;

/// An entry discovered while scanning an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub is_directory: bool,
    /// Uncompressed size announced by the local header, when it has one.
    pub size_hint: Option<u64>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, size_hint: Option<u64>) -> Self {
        let name = name.into();
        Self {
            is_directory: is_directory_name(&name),
            name,
            size_hint,
        }
    }
}

/// Names ending in a path separator denote directories.
pub fn is_directory_name(name: &str) -> bool {
    name.ends_with('/') || name.ends_with('\\')
}

/// One piece of an entry's payload.
///
/// Every payload ends with exactly one chunk whose `is_final` is set, which
/// may be empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Bytes,
    pub is_final: bool,
}

impl Chunk {
    pub fn new(bytes: impl Into<Bytes>, is_final: bool) -> Self {
        Self {
            bytes: bytes.into(),
            is_final,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pull-based view of an archive: a sequence of entries, each followed by a
/// lazy, finite, non-restartable sequence of payload chunks.
///
/// Callers request the next chunk only after they are ready for it; there is
/// no callback and no implicit buffering beyond the source's read chunk.
pub trait EntrySource: Send {
    /// Advance to the next entry, skipping whatever payload of the current
    /// entry has not been pulled. Returns `None` at the end of the archive.
    fn next_entry(&mut self) -> impl Future<Output = Result<Option<ArchiveEntry>>> + Send;

    /// Next payload chunk of the current entry. Returns `None` once the final
    /// chunk was delivered, and always for directories.
    ///
    /// Implementations must be cancel safe: dropping the future before it
    /// completes must not lose or duplicate payload bytes.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Chunk>>> + Send;

    /// Counter of raw bytes read from the underlying input, for sources that
    /// have one. A call that is waiting while this grows is not stalled.
    fn progress(&self) -> Option<ReadProgress> {
        None
    }
}
