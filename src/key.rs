//! Derived key construction for the two-table layout.
//!
//! Both tables share one keyspace in the primary store, partitioned by a
//! single-byte domain tag at the end of the digest:
//!
//! - index entries: `identity(reverse(bytes(multihash)) || 'I')`
//! - value entries: `identity(blake2b-160(provider || context) || 'M')`
//!
//! The identity wrapping keeps every stored key a well-formed multihash
//! while the store sees the payload verbatim. Reversal of the multihash
//! bytes puts the hash-distributed digest first so the store's key ordering
//! is dominated by well-mixed bytes.

use crate::error::IndexerError;
use crate::value::ProviderId;
use multihash::{Multihash, MultihashGeneric};

/// Domain tag terminating every index-table key digest.
pub const INDEX_KEY_SUFFIX: u8 = b'I';
/// Domain tag terminating every value-table key digest.
pub const VALUE_KEY_SUFFIX: u8 = b'M';

const IDENTITY_CODE: u64 = 0x00;
const VALUE_KEY_DIGEST_LEN: usize = 20;

/// Stored keys carry a public multihash (up to 64-byte digest) plus framing
/// and the domain tag, so they need the wider inline capacity.
type StoredKey = MultihashGeneric<128>;

/// Derive the index-table key for a multihash.
pub fn make_index_key(mh: &Multihash<64>) -> Result<Vec<u8>, IndexerError> {
    let bytes = mh.to_bytes();
    let mut digest = Vec::with_capacity(bytes.len() + 1);
    digest.extend(bytes.iter().rev());
    digest.push(INDEX_KEY_SUFFIX);
    wrap_identity(&digest)
}

/// Derive the value-table key for a `(provider, context)` pair. Metadata
/// never participates, so updates leave the key unchanged.
pub fn make_value_key(
    provider_id: &ProviderId,
    context_id: &[u8],
) -> Result<Vec<u8>, IndexerError> {
    let hash = blake2b_simd::Params::new()
        .hash_length(VALUE_KEY_DIGEST_LEN)
        .to_state()
        .update(provider_id.as_bytes())
        .update(context_id)
        .finalize();
    let mut digest = Vec::with_capacity(VALUE_KEY_DIGEST_LEN + 1);
    digest.extend_from_slice(hash.as_bytes());
    digest.push(VALUE_KEY_SUFFIX);
    wrap_identity(&digest)
}

/// The domain tag of a stored key, or an error if the key bytes are not a
/// well-formed identity multihash.
pub fn key_suffix(key: &[u8]) -> Result<Option<u8>, IndexerError> {
    let mh = StoredKey::from_bytes(key)
        .map_err(|e| IndexerError::Corrupt(format!("stored key: {}", e)))?;
    Ok(mh.digest().last().copied())
}

/// Recover the original multihash from an index-table key. Returns `None`
/// for keys outside the index domain.
pub fn multihash_from_index_key(key: &[u8]) -> Result<Option<Multihash<64>>, IndexerError> {
    let wrapped = StoredKey::from_bytes(key)
        .map_err(|e| IndexerError::Corrupt(format!("stored key: {}", e)))?;
    let digest = wrapped.digest();
    match digest.last() {
        Some(&INDEX_KEY_SUFFIX) => {}
        _ => return Ok(None),
    }
    let reversed: Vec<u8> = digest[..digest.len() - 1].iter().rev().copied().collect();
    let mh = Multihash::from_bytes(&reversed)
        .map_err(|e| IndexerError::Corrupt(format!("recovered multihash: {}", e)))?;
    Ok(Some(mh))
}

fn wrap_identity(digest: &[u8]) -> Result<Vec<u8>, IndexerError> {
    let wrapped = StoredKey::wrap(IDENTITY_CODE, digest)
        .map_err(|e| IndexerError::InvalidMultihash(e.to_string()))?;
    Ok(wrapped.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    #[test]
    fn test_index_key_roundtrip() {
        let mh = Code::Sha2_256.digest(b"some content");
        let key = make_index_key(&mh).unwrap();
        let recovered = multihash_from_index_key(&key).unwrap().unwrap();
        assert_eq!(recovered, mh);
    }

    #[test]
    fn test_index_key_injective() {
        let a = make_index_key(&Code::Sha2_256.digest(b"a")).unwrap();
        let b = make_index_key(&Code::Sha2_256.digest(b"b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_value_key_deterministic() {
        let p = ProviderId::from("peer-1");
        let k1 = make_value_key(&p, b"ctx").unwrap();
        let k2 = make_value_key(&p, b"ctx").unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, make_value_key(&p, b"other").unwrap());
        assert_ne!(k1, make_value_key(&ProviderId::from("peer-2"), b"ctx").unwrap());
    }

    #[test]
    fn test_domain_tags_partition() {
        let ik = make_index_key(&Code::Sha2_256.digest(b"x")).unwrap();
        let vk = make_value_key(&ProviderId::from("p"), b"c").unwrap();
        assert_eq!(key_suffix(&ik).unwrap(), Some(INDEX_KEY_SUFFIX));
        assert_eq!(key_suffix(&vk).unwrap(), Some(VALUE_KEY_SUFFIX));
        // A value key never decodes as an index key.
        assert!(multihash_from_index_key(&vk).unwrap().is_none());
    }

    #[test]
    fn test_garbage_key_is_corrupt() {
        // Length prefix claims more digest bytes than present.
        let bad = vec![0x00, 0x20, 0x01];
        assert!(matches!(key_suffix(&bad), Err(IndexerError::Corrupt(_))));
    }
}
