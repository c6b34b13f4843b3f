//! The capability set shared by every index backing.

use crate::error::IndexerError;
use crate::value::{ProviderId, Value};
use multihash::Multihash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Iterator over `(multihash, values)` pairs produced by [`Indexer::iter`].
pub type ValueSetIter<'a> =
    Box<dyn Iterator<Item = Result<(Multihash<64>, Vec<Value>), IndexerError>> + 'a>;

/// Cooperative cancellation flag for long-running scans.
///
/// Cloning shares the flag; any clone may cancel. Only
/// [`Indexer::remove_provider`] observes it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Uniform operations over a multihash-to-providers index.
///
/// Implemented by both the persistent engine and the in-memory sharded
/// cache; callers program against this trait and pick a backing at
/// construction time.
pub trait Indexer: Send + Sync {
    /// Look up every value advertised for `mh`. `Ok(None)` means the
    /// multihash is unknown; it is not an error.
    fn get(&self, mh: &Multihash<64>) -> Result<Option<Vec<Value>>, IndexerError>;

    /// Associate `value` with each multihash in `mhs`. Inserting the same
    /// value twice is a no-op; a value with a fresh metadata payload
    /// rewrites the stored record in place. An empty `mhs` probes the
    /// value table without creating anything.
    fn put(&self, value: Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError>;

    /// Detach `value` from each multihash in `mhs`. The value record itself
    /// survives, other multihashes may still reference it.
    fn remove(&self, value: &Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError>;

    /// Delete every value belonging to `provider`. Runs a full scan and is
    /// the only operation that honors cancellation.
    fn remove_provider(
        &self,
        cancel: &CancelToken,
        provider: &ProviderId,
    ) -> Result<(), IndexerError>;

    /// Delete the single value identified by `(provider, context_id)`.
    /// Index entries still pointing at it are repaired lazily on read.
    fn remove_provider_context(
        &self,
        provider: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), IndexerError>;

    /// Bytes consumed by the backing storage.
    fn size(&self) -> Result<u64, IndexerError>;

    /// Push buffered writes to durable storage. Returns any asynchronous
    /// write error observed since the previous flush.
    fn flush(&self) -> Result<(), IndexerError>;

    /// Finalize and release resources.
    fn close(&self) -> Result<(), IndexerError>;

    /// Iterate all indexed multihashes, each yielded at most once with its
    /// non-empty value list.
    fn iter(&self) -> Result<ValueSetIter<'_>, IndexerError>;
}
