//! # indexer-core
//!
//! A value-normalized index mapping content multihashes to the providers
//! that advertise them, built for ingest-heavy indexing services that
//! answer "who has this content?" over very large key populations.
//!
//! ## Architecture
//!
//! Storage splits into two tables over a pluggable primary key-value
//! store: an index table (multihash to value-key list) and a value table
//! (value-key to provider record). Records are deduplicated by
//! construction; removing a provider or context deletes one record and
//! lets readers lazily repair the index entries that still point at it.
//!
//! Two backings implement the same [`Indexer`] capability set:
//!
//! - [`PersistentIndex`] over a [`PrimaryStorage`] implementation, with
//!   [`DiskStore`] provided in-crate;
//! - [`ShardedCache`], an in-memory variant with rotation-based eviction
//!   and per-shard value interning.
//!
//! ## Example Usage
//!
//! ```no_run
//! use indexer_core::{Indexer, IndexConfig, PersistentIndex, Value};
//! use multihash_codetable::{Code, MultihashDigest};
//!
//! # fn main() -> Result<(), indexer_core::IndexerError> {
//! let index = PersistentIndex::open("/tmp/index", IndexConfig::default())?;
//!
//! let value = Value::new("peer-1", b"context".to_vec(), vec![0x01]);
//! let mh = Code::Sha2_256.digest(b"some content");
//! index.put(value, &[mh])?;
//!
//! if let Some(values) = index.get(&mh)? {
//!     println!("{} provider(s)", values.len());
//! }
//! index.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod interface;
pub mod key;
pub mod primary;
pub mod value;

mod persistent;

pub use cache::{CacheStats, ShardedCache};
pub use config::IndexConfig;
pub use disk_store::DiskStore;
pub use error::IndexerError;
pub use interface::{CancelToken, Indexer, ValueSetIter};
pub use persistent::PersistentIndex;
pub use primary::{PrimaryIter, PrimaryStorage};
pub use value::{ProviderId, Value};
