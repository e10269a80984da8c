//! Record header and layout for the hybrid log.
//!
//! Every record starts with a 16-byte header followed by its key and value,
//! each padded to 8 bytes:
//!
//! ```text
//! 0..8    RecordInfo word (little endian)
//! 8..12   key length (u32 LE)
//! 12..16  value length (u32 LE)
//! 16..    key bytes, padded to 8
//! ..      value bytes, padded to 8
//! ```
//!
//! When records are moved to an object log, the on-disk copy keeps the header
//! and stores the object-log offset of `key ++ value` at bytes 16..24. The record
//! keeps its in-memory size so logical addresses stay byte offsets on disk.
//!
//! All encoding goes through fixed offsets on byte slices; nothing depends on
//! host struct layout.

use std::ops::Range;

use crate::address::Address;

/// Record header word.
///
/// - Previous address (48 bits): next older record in the hash chain
/// - Version (12 bits): store version that wrote the record
/// - Lock (bit 60): exclusive in-place access in the mutable region
/// - Invalid (bit 61): record lost an insertion race and must be skipped
/// - Tombstone (bit 62): delete marker
/// - Final (bit 63): reserved marker, never set by the store itself
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordInfo(u64);

impl RecordInfo {
    const PREV_ADDR_MASK: u64 = (1 << 48) - 1;
    const VERSION_SHIFT: u32 = 48;
    /// Mask for the version (12 bits)
    pub const VERSION_MASK: u64 = (1 << 12) - 1;
    /// Lock bit
    pub const LOCK_BIT: u64 = 1 << 60;
    /// Invalid bit
    pub const INVALID_BIT: u64 = 1 << 61;
    /// Tombstone bit
    pub const TOMBSTONE_BIT: u64 = 1 << 62;
    const FINAL_BIT: u64 = 1 << 63;

    /// Create a new record header word.
    #[inline]
    pub const fn new(previous_address: Address, version: u32, tombstone: bool) -> Self {
        let mut control = previous_address.control() & Self::PREV_ADDR_MASK;
        control |= ((version as u64) & Self::VERSION_MASK) << Self::VERSION_SHIFT;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        Self(control)
    }

    /// Create from raw control value.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Raw control value.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if the word is all zeros (no record written here).
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Previous address in the hash chain.
    #[inline]
    pub const fn previous_address(&self) -> Address {
        Address::from_control(self.0 & Self::PREV_ADDR_MASK)
    }

    /// Version that wrote the record.
    #[inline]
    pub const fn version(&self) -> u32 {
        ((self.0 >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u32
    }

    /// Whether the lock bit is held.
    #[inline]
    pub const fn is_locked(&self) -> bool {
        (self.0 & Self::LOCK_BIT) != 0
    }

    /// Whether the record is invalid.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        (self.0 & Self::INVALID_BIT) != 0
    }

    /// Whether the record is a delete marker.
    #[inline]
    pub const fn is_tombstone(&self) -> bool {
        (self.0 & Self::TOMBSTONE_BIT) != 0
    }

    /// Whether the final bit is set.
    #[inline]
    pub const fn is_final(&self) -> bool {
        (self.0 & Self::FINAL_BIT) != 0
    }

    /// Same word with the invalid bit set.
    #[inline]
    pub const fn invalidated(self) -> Self {
        Self(self.0 | Self::INVALID_BIT)
    }

    /// Same word with the tombstone bit set.
    #[inline]
    pub const fn tombstoned(self) -> Self {
        Self(self.0 | Self::TOMBSTONE_BIT)
    }

    /// Same word with the tombstone bit cleared.
    #[inline]
    pub const fn revived(self) -> Self {
        Self(self.0 & !Self::TOMBSTONE_BIT)
    }

    /// Same word with the lock bit cleared.
    #[inline]
    pub const fn unlocked(self) -> Self {
        Self(self.0 & !Self::LOCK_BIT)
    }

    /// Same word with the lock bit set.
    #[inline]
    pub const fn locked(self) -> Self {
        Self(self.0 | Self::LOCK_BIT)
    }
}

impl std::fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordInfo")
            .field("previous_address", &self.previous_address())
            .field("version", &self.version())
            .field("locked", &self.is_locked())
            .field("invalid", &self.is_invalid())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

/// Size of the fixed record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Offset of the object-log address in an object-mode record.
pub const OBJECT_ADDRESS_OFFSET: usize = RECORD_HEADER_SIZE;

/// Smallest record: header plus room for an object-log address.
pub const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 8;

#[inline]
const fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

/// Log footprint of a record with the given key and value lengths.
#[inline]
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    let size = RECORD_HEADER_SIZE + pad8(key_len) + pad8(value_len);
    if size < MIN_RECORD_SIZE {
        MIN_RECORD_SIZE
    } else {
        size
    }
}

/// Decoded fixed header of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header word
    pub info: RecordInfo,
    /// Key length in bytes
    pub key_len: u32,
    /// Value length in bytes
    pub value_len: u32,
}

impl RecordHeader {
    /// Create a header.
    pub const fn new(info: RecordInfo, key_len: u32, value_len: u32) -> Self {
        Self {
            info,
            key_len,
            value_len,
        }
    }

    /// Log footprint of the record.
    #[inline]
    pub const fn record_size(&self) -> usize {
        record_size(self.key_len as usize, self.value_len as usize)
    }

    /// Bytes of key plus value, as stored in an object log.
    #[inline]
    pub const fn payload_len(&self) -> u64 {
        self.key_len as u64 + self.value_len as u64
    }

    /// Byte range of the key within the record.
    #[inline]
    pub const fn key_range(&self) -> Range<usize> {
        RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + self.key_len as usize
    }

    /// Byte range of the value within the record.
    #[inline]
    pub const fn value_range(&self) -> Range<usize> {
        let start = RECORD_HEADER_SIZE + pad8(self.key_len as usize);
        start..start + self.value_len as usize
    }

    /// Word holding the two lengths (key in the low half).
    #[inline]
    pub const fn lengths_word(&self) -> u64 {
        (self.key_len as u64) | ((self.value_len as u64) << 32)
    }

    /// Rebuild from the header word and the lengths word.
    #[inline]
    pub const fn from_words(info: u64, lengths: u64) -> Self {
        Self {
            info: RecordInfo::from_control(info),
            key_len: lengths as u32,
            value_len: (lengths >> 32) as u32,
        }
    }

    /// Write the header at the start of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.info.control().to_le_bytes());
        dst[8..12].copy_from_slice(&self.key_len.to_le_bytes());
        dst[12..16].copy_from_slice(&self.value_len.to_le_bytes());
    }

    /// Read a header from the start of `src`, if it is long enough.
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let info = u64::from_le_bytes(src[0..8].try_into().ok()?);
        let key_len = u32::from_le_bytes(src[8..12].try_into().ok()?);
        let value_len = u32::from_le_bytes(src[12..16].try_into().ok()?);
        Some(Self::new(RecordInfo::from_control(info), key_len, value_len))
    }
}

/// Encode a full in-memory record.
pub fn encode_record(info: RecordInfo, key: &[u8], value: &[u8]) -> Vec<u8> {
    let header = RecordHeader::new(info, key.len() as u32, value.len() as u32);
    let mut buf = vec![0u8; header.record_size()];
    header.encode(&mut buf);
    buf[header.key_range()].copy_from_slice(key);
    buf[header.value_range()].copy_from_slice(value);
    buf
}

/// Read the object-log address stored in an object-mode record.
pub fn decode_object_address(src: &[u8]) -> Option<u64> {
    let bytes = src.get(OBJECT_ADDRESS_OFFSET..OBJECT_ADDRESS_OFFSET + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Store the object-log address into an object-mode record.
pub fn encode_object_address(dst: &mut [u8], address: u64) {
    dst[OBJECT_ADDRESS_OFFSET..OBJECT_ADDRESS_OFFSET + 8].copy_from_slice(&address.to_le_bytes());
}
