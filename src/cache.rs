//! Sharded in-memory index with rotation-based eviction.
//!
//! Each shard keeps two generations of a multihash-to-values map. Writes
//! land in the current generation; when it reaches its rotation size the
//! previous generation is discarded, the current one takes its place, and
//! a fresh current generation starts. Lookups that hit the previous
//! generation move the entry forward, so hot multihashes survive
//! rotations while cold ones age out incrementally, one shard at a time.
//!
//! Values are interned per shard: equal `(provider, context)` records
//! share one allocation, and a multi-multihash put reuses the first
//! interned exemplar across every further shard it touches.

use crate::error::IndexerError;
use crate::interface::{CancelToken, Indexer, ValueSetIter};
use crate::value::{ProviderId, Value};
use multihash::Multihash;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_SHARD_COUNT: usize = 16;
const SINGLE_SHARD_BELOW: usize = 256;

/// Point-in-time counters over all shards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Multihash entries across both generations.
    pub indexes: usize,
    /// Distinct interned values.
    pub values: usize,
    /// Total generation rotations since construction.
    pub rotations: u64,
}

/// One interned value record. Metadata sits behind its own lock so an
/// update through any shard is observed by every list holding the record.
struct Interned {
    provider_id: ProviderId,
    context_id: Box<[u8]>,
    metadata: Mutex<Box<[u8]>>,
}

impl Interned {
    fn new(value: &Value) -> Self {
        Self {
            provider_id: value.provider_id.clone(),
            context_id: value.context_id.clone().into_boxed_slice(),
            metadata: Mutex::new(value.metadata.clone().into_boxed_slice()),
        }
    }

    fn to_value(&self) -> Value {
        Value {
            provider_id: self.provider_id.clone(),
            context_id: self.context_id.to_vec(),
            metadata: self.metadata.lock().to_vec(),
        }
    }

    fn matches(&self, provider_id: &ProviderId, context_id: &[u8]) -> bool {
        self.provider_id == *provider_id && *self.context_id == *context_id
    }
}

/// Canonical byte-equal form of a `(provider, context)` pair, used as the
/// interner key within a shard.
fn intern_key(provider_id: &ProviderId, context_id: &[u8]) -> Box<[u8]> {
    let provider = provider_id.as_bytes();
    let mut buf = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(provider.len(), &mut buf);
    let mut key = Vec::with_capacity(prefix.len() + provider.len() + context_id.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(provider);
    key.extend_from_slice(context_id);
    key.into_boxed_slice()
}

type Generation = HashMap<Box<[u8]>, Vec<Arc<Interned>>>;

struct Shard {
    current: Generation,
    previous: Generation,
    interned: HashMap<Box<[u8]>, Arc<Interned>>,
    rotate_size: usize,
    rotations: u64,
}

impl Shard {
    fn new(rotate_size: usize) -> Self {
        Self {
            current: HashMap::new(),
            previous: HashMap::new(),
            interned: HashMap::new(),
            rotate_size: rotate_size.max(1),
            rotations: 0,
        }
    }

    fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
        self.rotations += 1;
        // Records referenced only by the discarded generation are
        // unreachable now; let them go.
        self.interned.retain(|_, v| Arc::strong_count(v) > 1);
    }

    /// Intern `value` in this shard, reusing `exemplar` when an earlier
    /// shard already interned it during the same put.
    fn intern(&mut self, value: &Value, exemplar: &mut Option<Arc<Interned>>) -> Arc<Interned> {
        let key = intern_key(&value.provider_id, &value.context_id);
        if let Some(existing) = self.interned.get(&key) {
            let mut metadata = existing.metadata.lock();
            if **metadata != *value.metadata {
                *metadata = value.metadata.clone().into_boxed_slice();
            }
            drop(metadata);
            let existing = existing.clone();
            exemplar.get_or_insert_with(|| existing.clone());
            return existing;
        }
        let record = match exemplar {
            Some(record) => record.clone(),
            None => {
                let record = Arc::new(Interned::new(value));
                *exemplar = Some(record.clone());
                record
            }
        };
        self.interned.insert(key, record.clone());
        record
    }

    fn add(&mut self, key: &[u8], record: Arc<Interned>) {
        if let Some(list) = self.current.get_mut(key) {
            if !list.iter().any(|v| Arc::ptr_eq(v, &record)) {
                list.push(record);
            }
            return;
        }
        let mut list = self.previous.remove(key).unwrap_or_default();
        if !list.iter().any(|v| Arc::ptr_eq(v, &record)) {
            list.push(record);
        }
        if self.current.len() >= self.rotate_size {
            self.rotate();
        }
        self.current.insert(key.into(), list);
    }

    fn get(&mut self, key: &[u8]) -> Option<Vec<Value>> {
        if let Some(list) = self.current.get(key) {
            return Some(list.iter().map(|v| v.to_value()).collect());
        }
        // Hit in the previous generation: promote so the entry outlives
        // the next rotation.
        let list = self.previous.remove(key)?;
        let values = list.iter().map(|v| v.to_value()).collect();
        if self.current.len() >= self.rotate_size {
            self.rotate();
        }
        self.current.insert(key.into(), list);
        Some(values)
    }

    fn remove(&mut self, key: &[u8], provider_id: &ProviderId, context_id: &[u8]) {
        for generation in [&mut self.current, &mut self.previous] {
            if let Some(list) = generation.get_mut(key) {
                list.retain(|v| !v.matches(provider_id, context_id));
                if list.is_empty() {
                    generation.remove(key);
                }
            }
        }
    }

    fn sweep(&mut self, mut dead: impl FnMut(&Interned) -> bool) {
        for generation in [&mut self.current, &mut self.previous] {
            generation.retain(|_, list| {
                list.retain(|v| !dead(v.as_ref()));
                !list.is_empty()
            });
        }
        self.interned.retain(|_, v| !dead(v.as_ref()));
    }

    fn byte_estimate(&self) -> u64 {
        let mut total = 0u64;
        for generation in [&self.current, &self.previous] {
            for (key, list) in generation {
                total += key.len() as u64;
                total += (list.len() * std::mem::size_of::<Arc<Interned>>()) as u64;
            }
        }
        for (key, value) in &self.interned {
            total += key.len() as u64;
            total += (value.provider_id.as_bytes().len()
                + value.context_id.len()
                + value.metadata.lock().len()) as u64;
        }
        total
    }
}

/// In-memory [`Indexer`] backing with the same observable semantics as the
/// persistent engine, minus durability.
pub struct ShardedCache {
    shards: Vec<Mutex<Shard>>,
    /// Shard count minus one; the count is a power of two.
    mask: usize,
}

impl ShardedCache {
    /// Build a cache bounded to roughly `capacity` multihash entries.
    pub fn new(capacity: usize) -> Self {
        let shard_count = if capacity < SINGLE_SHARD_BELOW {
            1
        } else {
            DEFAULT_SHARD_COUNT
        };
        let rotate_size = capacity / (shard_count * 2);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(rotate_size)))
            .collect();
        Self {
            shards,
            mask: shard_count - 1,
        }
    }

    fn shard_for(&self, key: &[u8]) -> &Mutex<Shard> {
        // The low digest byte is well-distributed for hash-derived keys.
        let last = key.last().copied().unwrap_or(0) as usize;
        &self.shards[last & self.mask]
    }

    pub fn stats(&self) -> CacheStats {
        self.shards
            .par_iter()
            .map(|shard| {
                let shard = shard.lock();
                CacheStats {
                    indexes: shard.current.len() + shard.previous.len(),
                    values: shard.interned.len(),
                    rotations: shard.rotations,
                }
            })
            .reduce(CacheStats::default, |a, b| CacheStats {
                indexes: a.indexes + b.indexes,
                values: a.values + b.values,
                rotations: a.rotations + b.rotations,
            })
    }
}

impl Indexer for ShardedCache {
    fn get(&self, mh: &Multihash<64>) -> Result<Option<Vec<Value>>, IndexerError> {
        let key = mh.to_bytes();
        Ok(self.shard_for(&key).lock().get(&key))
    }

    fn put(&self, value: Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        if value.metadata.is_empty() {
            return Err(IndexerError::EmptyMetadata);
        }
        let mut exemplar: Option<Arc<Interned>> = None;
        for mh in mhs {
            let key = mh.to_bytes();
            let mut shard = self.shard_for(&key).lock();
            let record = shard.intern(&value, &mut exemplar);
            shard.add(&key, record);
        }
        Ok(())
    }

    fn remove(&self, value: &Value, mhs: &[Multihash<64>]) -> Result<(), IndexerError> {
        for mh in mhs {
            let key = mh.to_bytes();
            self.shard_for(&key)
                .lock()
                .remove(&key, &value.provider_id, &value.context_id);
        }
        Ok(())
    }

    fn remove_provider(
        &self,
        cancel: &CancelToken,
        provider: &ProviderId,
    ) -> Result<(), IndexerError> {
        self.shards.par_iter().try_for_each(|shard| {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            shard.lock().sweep(|v| v.provider_id == *provider);
            Ok(())
        })
    }

    fn remove_provider_context(
        &self,
        provider: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), IndexerError> {
        self.shards.par_iter().for_each(|shard| {
            shard.lock().sweep(|v| v.matches(provider, context_id));
        });
        Ok(())
    }

    fn size(&self) -> Result<u64, IndexerError> {
        Ok(self
            .shards
            .par_iter()
            .map(|shard| shard.lock().byte_estimate())
            .sum())
    }

    fn flush(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    fn close(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    fn iter(&self) -> Result<ValueSetIter<'_>, IndexerError> {
        let mut snapshot: Vec<(Multihash<64>, Vec<Value>)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for generation in [&shard.current, &shard.previous] {
                for (key, list) in generation {
                    if list.is_empty() {
                        continue;
                    }
                    let mh = Multihash::from_bytes(key)
                        .map_err(|e| IndexerError::Corrupt(format!("cached key: {}", e)))?;
                    snapshot.push((mh, list.iter().map(|v| v.to_value()).collect()));
                }
            }
        }
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}
