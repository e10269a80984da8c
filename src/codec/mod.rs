//! Byte forms of keys and values.
//!
//! Records hold keys and values as bytes. The store hashes encoded keys for
//! the index, compares them byte-wise against keys found in the log, and
//! decodes values only when a callback needs them. A type picks its codec
//! through [`PersistKey`] or [`PersistValue`]; every `bytemuck::Pod` type gets
//! a fixed-size codec for free.

mod builtin;

pub use builtin::{PodCodec, RawBytes, RawBytesCodec, Utf8, Utf8Codec};

use crate::error::KvError;

/// A type that can be used as a key.
pub trait PersistKey: Clone + Send + Sync + 'static {
    /// Codec writing the key into records.
    type Codec: KeyCodec<Self>;
}

/// A type that can be used as a value.
pub trait PersistValue: Clone + Send + Sync + 'static {
    /// Codec writing the value into records.
    type Codec: ValueCodec<Self>;
}

/// Key encoding.
///
/// Keys are never decoded: lookups compare encoded bytes.
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// Append the encoded key to `dst`.
    fn encode(key: &K, dst: &mut Vec<u8>) -> Result<(), KvError>;

    /// Hash of an encoded key.
    ///
    /// Bucket positions in index checkpoints come from this hash, and index
    /// growth recomputes it from keys read back from the log, so it must only
    /// depend on the bytes.
    #[inline]
    fn hash_encoded(encoded: &[u8]) -> u64 {
        hash64(encoded)
    }
}

/// Value encoding.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// Append the encoded value to `dst`.
    fn encode(value: &V, dst: &mut Vec<u8>) -> Result<(), KvError>;

    /// Rebuild a value from its encoded bytes.
    fn decode(encoded: &[u8]) -> Result<V, KvError>;
}

/// Stable 64-bit xxh3 hash of key bytes.
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

pub(crate) fn encode_key<K: PersistKey>(key: &K) -> Result<Vec<u8>, KvError> {
    let mut buf = Vec::new();
    K::Codec::encode(key, &mut buf)?;
    Ok(buf)
}

pub(crate) fn encode_value<V: PersistValue>(value: &V) -> Result<Vec<u8>, KvError> {
    let mut buf = Vec::new();
    V::Codec::encode(value, &mut buf)?;
    Ok(buf)
}

pub(crate) fn decode_value<V: PersistValue>(encoded: &[u8]) -> Result<V, KvError> {
    V::Codec::decode(encoded)
}

/// Index hash of an encoded key of type `K`.
#[inline]
pub(crate) fn key_hash<K: PersistKey>(encoded: &[u8]) -> u64 {
    K::Codec::hash_encoded(encoded)
}
