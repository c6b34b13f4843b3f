//! Provider value records and their wire codecs.
//!
//! A [`Value`] is the unit handed back to callers: a provider identity, a
//! caller-assigned context, and opaque metadata. Uniqueness is defined over
//! the `(provider, context)` pair; two values that agree on the pair but
//! differ in metadata represent an update of the same record.

use crate::error::IndexerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque byte-string identity of a content provider.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderId(Vec<u8>);

impl ProviderId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for ProviderId {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl fmt::Debug for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A single advertisement record: who provides the content and under which
/// context, plus opaque metadata describing how to retrieve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub provider_id: ProviderId,
    pub context_id: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl Value {
    pub fn new(
        provider_id: impl Into<ProviderId>,
        context_id: impl Into<Vec<u8>>,
        metadata: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            context_id: context_id.into(),
            metadata: metadata.into(),
        }
    }

    /// True when `other` addresses the same record, metadata aside.
    pub fn same_record(&self, other: &Value) -> bool {
        self.provider_id == other.provider_id && self.context_id == other.context_id
    }
}

/// Serialize a value record into its stored form.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, IndexerError> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a stored value record. An unrecognizable byte string is a
/// corruption, not a serialization error.
pub fn decode_value(bytes: &[u8]) -> Result<Value, IndexerError> {
    bincode::deserialize(bytes).map_err(|e| IndexerError::Corrupt(format!("value record: {}", e)))
}

/// Serialize a value-key list: varint count, then each key varint-length
/// prefixed. The framing must round-trip byte-identically.
pub fn encode_value_keys(keys: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::usize_buffer();
    let mut out = Vec::with_capacity(keys.iter().map(|k| k.len() + 2).sum::<usize>() + 2);
    out.extend_from_slice(unsigned_varint::encode::usize(keys.len(), &mut buf));
    for key in keys {
        out.extend_from_slice(unsigned_varint::encode::usize(key.len(), &mut buf));
        out.extend_from_slice(key);
    }
    out
}

/// Deserialize a value-key list produced by [`encode_value_keys`].
pub fn decode_value_keys(bytes: &[u8]) -> Result<Vec<Vec<u8>>, IndexerError> {
    let corrupt = |why: &str| IndexerError::Corrupt(format!("value-key list: {}", why));

    let (count, mut rest) =
        unsigned_varint::decode::usize(bytes).map_err(|_| corrupt("bad count prefix"))?;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        let (len, tail) =
            unsigned_varint::decode::usize(rest).map_err(|_| corrupt("bad length prefix"))?;
        if tail.len() < len {
            return Err(corrupt("truncated entry"));
        }
        keys.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    if !rest.is_empty() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip() {
        let value = Value::new("peer-1", b"ctx".to_vec(), vec![0x01, 0x02]);
        let encoded = encode_value(&value).unwrap();
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_garbage_is_corrupt() {
        let result = decode_value(&[0xff; 3]);
        assert!(matches!(result, Err(IndexerError::Corrupt(_))));
    }

    #[test]
    fn test_same_record_ignores_metadata() {
        let a = Value::new("p", b"c".to_vec(), vec![1]);
        let b = Value::new("p", b"c".to_vec(), vec![2]);
        let c = Value::new("p", b"other".to_vec(), vec![1]);
        assert!(a.same_record(&b));
        assert!(!a.same_record(&c));
    }

    #[test]
    fn test_value_keys_roundtrip() {
        let keys = vec![vec![1u8, 2, 3], vec![], vec![0xaa; 21]];
        let encoded = encode_value_keys(&keys);
        assert_eq!(decode_value_keys(&encoded).unwrap(), keys);

        let empty = encode_value_keys(&[]);
        assert!(decode_value_keys(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_value_keys_truncated() {
        let mut encoded = encode_value_keys(&[vec![7u8; 10]]);
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            decode_value_keys(&encoded),
            Err(IndexerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_value_keys_trailing_bytes() {
        let mut encoded = encode_value_keys(&[vec![7u8; 4]]);
        encoded.push(0);
        assert!(matches!(
            decode_value_keys(&encoded),
            Err(IndexerError::Corrupt(_))
        ));
    }
}
