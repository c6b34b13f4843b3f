//! The seam between the index engine and its persistent key-value store.

use crate::error::IndexerError;

/// Entries yielded by a primary-store scan. Keys may repeat across storage
/// segments and values may be stale; callers re-fetch by key when they need
/// the current record.
pub type PrimaryIter<'a> =
    Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), IndexerError>> + 'a>;

/// Minimal contract the persistent engine requires of its backing store.
///
/// Implementations must be safe for concurrent use of these primitives; the
/// engine adds its own locks only around multi-step read-modify-write
/// sequences.
pub trait PrimaryStorage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError>;

    /// Remove a key. Returns whether it was present.
    fn remove(&self, key: &[u8]) -> Result<bool, IndexerError>;

    /// Make buffered writes durable and surface any asynchronous write
    /// error observed since the previous flush.
    fn flush(&self) -> Result<(), IndexerError>;

    fn close(&self) -> Result<(), IndexerError>;

    /// Scan the backing storage. The stream covers every live key at least
    /// once but may also surface superseded duplicates.
    fn iter(&self) -> Result<PrimaryIter<'_>, IndexerError>;

    /// Bytes consumed on disk, index and data files combined.
    fn storage_size(&self) -> Result<u64, IndexerError>;
}
