//! Codecs shipped with the store.

use std::marker::PhantomData;

use bytemuck::Pod;
use bytes::Bytes;

use crate::codec::{KeyCodec, PersistKey, PersistValue, ValueCodec};
use crate::error::KvError;

/// Fixed-width codec writing a `Pod` value's memory as is (little-endian on
/// every supported target).
pub struct PodCodec<T>(PhantomData<fn() -> T>);

impl<T: Pod + Send + Sync> KeyCodec<T> for PodCodec<T> {
    #[inline]
    fn encode(key: &T, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(bytemuck::bytes_of(key));
        Ok(())
    }
}

impl<T: Pod + Send + Sync> ValueCodec<T> for PodCodec<T> {
    #[inline]
    fn encode(value: &T, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<T, KvError> {
        bytemuck::try_pod_read_unaligned(encoded)
            .map_err(|_| KvError::Codec("fixed-width value has the wrong length"))
    }
}

impl<T: Pod + Send + Sync> PersistKey for T {
    type Codec = PodCodec<T>;
}

impl<T: Pod + Send + Sync> PersistValue for T {
    type Codec = PodCodec<T>;
}

/// Opaque byte string; its length may change from one version to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RawBytes(pub Bytes);

impl From<Bytes> for RawBytes {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<Vec<u8>> for RawBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&'static [u8]> for RawBytes {
    fn from(value: &'static [u8]) -> Self {
        Self(Bytes::from_static(value))
    }
}

/// Stores [`RawBytes`] without framing; the record header carries the length.
pub struct RawBytesCodec;

impl KeyCodec<RawBytes> for RawBytesCodec {
    #[inline]
    fn encode(key: &RawBytes, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(&key.0);
        Ok(())
    }
}

impl ValueCodec<RawBytes> for RawBytesCodec {
    #[inline]
    fn encode(value: &RawBytes, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(&value.0);
        Ok(())
    }

    fn decode(encoded: &[u8]) -> Result<RawBytes, KvError> {
        Ok(RawBytes(Bytes::copy_from_slice(encoded)))
    }
}

impl PersistKey for RawBytes {
    type Codec = RawBytesCodec;
}

impl PersistValue for RawBytes {
    type Codec = RawBytesCodec;
}

/// UTF-8 text key or value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Utf8(pub String);

impl From<String> for Utf8 {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Utf8 {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Stores [`Utf8`] as its bytes; decoding validates them.
pub struct Utf8Codec;

impl KeyCodec<Utf8> for Utf8Codec {
    #[inline]
    fn encode(key: &Utf8, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(key.0.as_bytes());
        Ok(())
    }
}

impl ValueCodec<Utf8> for Utf8Codec {
    #[inline]
    fn encode(value: &Utf8, dst: &mut Vec<u8>) -> Result<(), KvError> {
        dst.extend_from_slice(value.0.as_bytes());
        Ok(())
    }

    fn decode(encoded: &[u8]) -> Result<Utf8, KvError> {
        std::str::from_utf8(encoded)
            .map(|text| Utf8(text.to_owned()))
            .map_err(|_| KvError::Codec("value is not valid UTF-8"))
    }
}

impl PersistKey for Utf8 {
    type Codec = Utf8Codec;
}

impl PersistValue for Utf8 {
    type Codec = Utf8Codec;
}
