//! Persistent index engine over a primary key-value store.
//!
//! Storage is split across two tables sharing one keyspace:
//!
//! - the index table maps each multihash to the list of value-keys
//!   advertising it;
//! - the value table maps a value-key to the single serialized record for
//!   its `(provider, context)` pair.
//!
//! Normalization falls out of the split: however many multihashes a
//! provider advertises, its record is stored once and referenced by key.
//! Deleting a record (provider or context removal) deliberately does not
//! walk the index table; readers that later trip over the dangling
//! reference drop it from the list and write the repaired list back.
//!
//! Locking discipline: a single read/write lock covers the value table,
//! a striped mutex pool covers index entries. The value-lock is always
//! taken before any per-key lock and never while one is held. Any new
//! operation must keep that order.

use crate::config::IndexConfig;
use crate::disk_store::DiskStore;
use crate::error::IndexerError;
use crate::interface::{CancelToken, Indexer, ValueSetIter};
use crate::key::{key_suffix, make_index_key, make_value_key, multihash_from_index_key, VALUE_KEY_SUFFIX};
use crate::primary::{PrimaryIter, PrimaryStorage};
use crate::value::{
    decode_value, decode_value_keys, encode_value, encode_value_keys, ProviderId, Value,
};
use multihash::Multihash;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::path::Path;

const CANCEL_CHECK_EVERY: usize = 1024;

/// Fixed pool of stripe mutexes guarding index-table read-modify-write
/// sequences. Distinct keys on distinct stripes proceed in parallel; a
/// stripe collision costs a short wait, not a correctness problem.
struct LockPool {
    stripes: Vec<Mutex<()>>,
}

impl LockPool {
    fn new() -> Self {
        let stripes = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two();
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let stripe = crc32fast::hash(key) as usize & (self.stripes.len() - 1);
        self.stripes[stripe].lock()
    }
}

/// Durable [`Indexer`] backing over any [`PrimaryStorage`].
pub struct PersistentIndex<S: PrimaryStorage> {
    store: S,
    value_lock: RwLock<()>,
    index_locks: LockPool,
}

impl PersistentIndex<DiskStore> {
    /// Open a disk-backed index under `dir`.
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self, IndexerError> {
        Ok(Self::new(DiskStore::open(dir, config)?))
    }
}

impl<S: PrimaryStorage> PersistentIndex<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            value_lock: RwLock::new(()),
            index_locks: LockPool::new(),
        }
    }

    fn put_impl(&self, value: Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        if value.metadata.is_empty() {
            return Err(IndexerError::EmptyMetadata);
        }
        let vk = make_value_key(&value.provider_id, &value.context_id)?;
        let encoded = encode_value(&value)?;

        {
            let _value_guard = self.value_lock.write();
            match self
                .store
                .get(&vk)
                .map_err(IndexerError::storage("read value record"))?
            {
                // Nothing to index means this is only a probe; do not
                // create the record.
                None if mhs.is_empty() => {}
                None => self
                    .store
                    .put(&vk, &encoded)
                    .map_err(IndexerError::storage("write value record"))?,
                Some(existing) if existing != encoded => self
                    .store
                    .put(&vk, &encoded)
                    .map_err(IndexerError::storage("write value record"))?,
                Some(_) => {}
            }
        }

        for mh in mhs {
            let ik = make_index_key(mh)?;
            let _key_guard = self.index_locks.lock(&ik);
            let mut vks = match self
                .store
                .get(&ik)
                .map_err(IndexerError::storage("read index entry"))?
            {
                Some(raw) => decode_value_keys(&raw)?,
                None => Vec::new(),
            };
            if vks.iter().any(|k| *k == vk) {
                continue;
            }
            vks.push(vk.clone());
            self.store
                .put(&ik, &encode_value_keys(&vks))
                .map_err(IndexerError::storage("write index entry"))?;
        }
        Ok(())
    }

    fn get_impl(&self, mh: &Multihash<64>) -> Result<Option<Vec<Value>>, IndexerError> {
        let ik = make_index_key(mh)?;
        let Some(raw) = self
            .store
            .get(&ik)
            .map_err(IndexerError::storage("read index entry"))?
        else {
            return Ok(None);
        };
        let mut vks = decode_value_keys(&raw)?;

        let mut values = Vec::with_capacity(vks.len());
        let mut repaired = false;
        {
            let _value_guard = self.value_lock.read();
            let mut i = 0;
            while i < vks.len() {
                match self
                    .store
                    .get(&vks[i])
                    .map_err(IndexerError::storage("read value record"))?
                {
                    Some(bytes) => {
                        values.push(decode_value(&bytes)?);
                        i += 1;
                    }
                    // Dangling reference left behind by a provider or
                    // context removal: drop it from the working list.
                    None => {
                        vks.swap_remove(i);
                        repaired = true;
                    }
                }
            }
        }

        if repaired {
            let _key_guard = self.index_locks.lock(&ik);
            if vks.is_empty() {
                self.store
                    .remove(&ik)
                    .map_err(IndexerError::storage("delete index entry"))?;
            } else {
                self.store
                    .put(&ik, &encode_value_keys(&vks))
                    .map_err(IndexerError::storage("write index entry"))?;
            }
        }

        if values.is_empty() {
            Ok(None)
        } else {
            Ok(Some(values))
        }
    }

    fn remove_impl(&self, value: &Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        let vk = make_value_key(&value.provider_id, &value.context_id)?;
        for mh in mhs {
            let ik = make_index_key(mh)?;
            let _key_guard = self.index_locks.lock(&ik);
            let Some(raw) = self
                .store
                .get(&ik)
                .map_err(IndexerError::storage("read index entry"))?
            else {
                continue;
            };
            let mut vks = decode_value_keys(&raw)?;
            let Some(pos) = vks.iter().position(|k| *k == vk) else {
                continue;
            };
            if vks.len() == 1 {
                self.store
                    .remove(&ik)
                    .map_err(IndexerError::storage("delete index entry"))?;
            } else {
                vks.swap_remove(pos);
                self.store
                    .put(&ik, &encode_value_keys(&vks))
                    .map_err(IndexerError::storage("write index entry"))?;
            }
        }
        Ok(())
    }

    fn remove_provider_impl(
        &self,
        cancel: &CancelToken,
        provider: &ProviderId,
    ) -> Result<(), IndexerError> {
        self.store
            .flush()
            .map_err(IndexerError::storage("flush before provider removal"))?;

        let _value_guard = self.value_lock.write();
        let iter = self
            .store
            .iter()
            .map_err(IndexerError::storage("scan primary storage"))?;
        for (i, entry) in iter.enumerate() {
            if i % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            let (key, _) = entry.map_err(IndexerError::storage("scan primary storage"))?;
            if key_suffix(&key)? != Some(VALUE_KEY_SUFFIX) {
                continue;
            }
            // The scan may yield stale or deleted entries; the current
            // record decides.
            let Some(bytes) = self
                .store
                .get(&key)
                .map_err(IndexerError::storage("read value record"))?
            else {
                continue;
            };
            if decode_value(&bytes)?.provider_id == *provider {
                self.store
                    .remove(&key)
                    .map_err(IndexerError::storage("delete value record"))?;
            }
        }
        Ok(())
    }

    fn remove_provider_context_impl(
        &self,
        provider: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), IndexerError> {
        let vk = make_value_key(provider, context_id)?;
        let _value_guard = self.value_lock.write();
        self.store
            .remove(&vk)
            .map_err(IndexerError::storage("delete value record"))?;
        Ok(())
    }
}

impl<S: PrimaryStorage> Indexer for PersistentIndex<S> {
    fn get(&self, mh: &Multihash<64>) -> Result<Option<Vec<Value>>, IndexerError> {
        self.get_impl(mh)
    }

    fn put(&self, value: Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        self.put_impl(value, mhs)
    }

    fn remove(&self, value: &Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        self.remove_impl(value, mhs)
    }

    fn remove_provider(
        &self,
        cancel: &CancelToken,
        provider: &ProviderId,
    ) -> Result<(), IndexerError> {
        self.remove_provider_impl(cancel, provider)
    }

    fn remove_provider_context(
        &self,
        provider: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), IndexerError> {
        self.remove_provider_context_impl(provider, context_id)
    }

    fn size(&self) -> Result<u64, IndexerError> {
        self.store
            .storage_size()
            .map_err(IndexerError::storage("measure storage"))
    }

    fn flush(&self) -> Result<(), IndexerError> {
        self.store.flush().map_err(IndexerError::storage("flush"))
    }

    fn close(&self) -> Result<(), IndexerError> {
        self.store.close().map_err(IndexerError::storage("close"))
    }

    fn iter(&self) -> Result<ValueSetIter<'_>, IndexerError> {
        self.store
            .flush()
            .map_err(IndexerError::storage("flush before iterate"))?;
        let inner = self
            .store
            .iter()
            .map_err(IndexerError::storage("scan primary storage"))?;
        Ok(Box::new(PersistentIter {
            index: self,
            inner,
            seen: HashSet::new(),
        }))
    }
}

/// Iterator recovering multihashes from stored index keys and resolving
/// their value lists through the same repair path as `get`.
struct PersistentIter<'a, S: PrimaryStorage> {
    index: &'a PersistentIndex<S>,
    inner: PrimaryIter<'a>,
    /// Multihashes already emitted; the primary scan can repeat keys
    /// across segments.
    seen: HashSet<Vec<u8>>,
}

impl<S: PrimaryStorage> Iterator for PersistentIter<'_, S> {
    type Item = Result<(Multihash<64>, Vec<Value>), IndexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next() {
                Some(entry) => entry,
                None => {
                    // End of stream: the dedup set has done its job.
                    self.seen = HashSet::new();
                    return None;
                }
            };
            let (key, _) = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let mh = match multihash_from_index_key(&key) {
                Ok(Some(mh)) => mh,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            if !self.seen.insert(mh.to_bytes()) {
                continue;
            }
            match self.index.get_impl(&mh) {
                // All references were dangling (or the entry is gone);
                // nothing to report for this multihash.
                Ok(None) => continue,
                Ok(Some(values)) => return Some(Ok((mh, values))),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
