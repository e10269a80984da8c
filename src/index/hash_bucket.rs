//! Hash bucket structures for the hash index
//!
//! A bucket is one cache line: seven entry words plus one overflow word.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;

/// Entry stored in a hash bucket
///
/// Packed into 8 bytes with the following layout:
/// - address (47 bits): Logical address of the newest record in the chain
/// - read cache (1 bit, bit 47): Address refers to a read cache
/// - tag (14 bits): Hash tag for quick comparison
/// - reserved (1 bit)
/// - tentative (1 bit, bit 63): Entry is being inserted and invisible to readers
///
/// The all-zero word is the unused entry.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    /// Invalid/empty entry value
    pub const INVALID: Self = Self(0);

    /// Number of bits for the tag
    pub const TAG_BITS: u32 = 14;

    const ADDRESS_MASK: u64 = (1 << 47) - 1;
    const READ_CACHE_BIT: u64 = 1 << 47;
    const TAG_SHIFT: u32 = 48;
    const TAG_MASK: u64 = (1 << Self::TAG_BITS) - 1;
    const TENTATIVE_BIT: u64 = 1 << 63;

    /// Create a new entry
    #[inline]
    pub const fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::ADDRESS_MASK;
        control |= ((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            control |= Self::TENTATIVE_BIT;
        }
        Self(control)
    }

    /// Create a new entry with the read cache flag set or cleared
    #[inline]
    pub const fn with_read_cache(self, read_cache: bool) -> Self {
        if read_cache {
            Self(self.0 | Self::READ_CACHE_BIT)
        } else {
            Self(self.0 & !Self::READ_CACHE_BIT)
        }
    }

    /// Create an entry from raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Check if this entry is unused
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Get the address portion
    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    /// Get the tag portion
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    /// Check if entry is tentative (being inserted)
    #[inline]
    pub const fn is_tentative(&self) -> bool {
        (self.0 & Self::TENTATIVE_BIT) != 0
    }

    /// Check if address points to read cache
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_BIT) != 0
    }

    /// Same entry with the tentative bit cleared
    #[inline]
    pub const fn confirmed(&self) -> Self {
        Self(self.0 & !Self::TENTATIVE_BIT)
    }

    /// Same tag and flags, different address
    #[inline]
    pub const fn with_address(&self, address: Address) -> Self {
        Self((self.0 & !Self::ADDRESS_MASK) | (address.control() & Self::ADDRESS_MASK))
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for HashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBucketEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .field("tentative", &self.is_tentative())
            .field("read_cache", &self.in_read_cache())
            .finish()
    }
}

/// Atomic version of HashBucketEntry for thread-safe operations
#[repr(transparent)]
pub struct AtomicHashBucketEntry {
    control: AtomicU64,
}

impl AtomicHashBucketEntry {
    /// Create a new invalid/empty entry
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Load the entry atomically
    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketEntry {
        HashBucketEntry(self.control.load(ordering))
    }

    /// Store an entry atomically
    #[inline]
    pub fn store(&self, entry: HashBucketEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    /// Compare and exchange
    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        self.control
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(HashBucketEntry)
            .map_err(HashBucketEntry)
    }

    /// Clear the tentative bit, returning the previous entry.
    #[inline]
    pub fn clear_tentative(&self) -> HashBucketEntry {
        HashBucketEntry(
            self.control
                .fetch_and(!HashBucketEntry::TENTATIVE_BIT, Ordering::AcqRel),
        )
    }
}

impl Default for AtomicHashBucketEntry {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Debug for AtomicHashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

/// Entry pointing to the next overflow bucket
///
/// Holds a 1-based index into the overflow bucket pool; zero means no overflow.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct HashBucketOverflowEntry(u64);

impl HashBucketOverflowEntry {
    /// Empty entry value
    pub const INVALID: Self = Self(0);

    /// Create an overflow entry for the given pool index (1-based)
    #[inline]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Check if the entry is unused
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// 1-based pool index of the next bucket
    #[inline]
    pub const fn index(&self) -> u64 {
        self.0
    }
}

/// Atomic overflow entry
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicHashBucketOverflowEntry {
    control: AtomicU64,
}

impl AtomicHashBucketOverflowEntry {
    /// Create an invalid/empty entry
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Load the entry atomically
    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketOverflowEntry {
        HashBucketOverflowEntry(self.control.load(ordering))
    }

    /// Store an entry atomically
    #[inline]
    pub fn store(&self, entry: HashBucketOverflowEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    /// Link a new overflow bucket if none is linked yet.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketOverflowEntry,
        new: HashBucketOverflowEntry,
    ) -> Result<HashBucketOverflowEntry, HashBucketOverflowEntry> {
        self.control
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(HashBucketOverflowEntry)
            .map_err(HashBucketOverflowEntry)
    }
}

/// Hash bucket
///
/// Contains 7 entries plus one overflow pointer, fitting in a cache line (64 bytes).
#[repr(C, align(64))]
#[derive(Default)]
pub struct HashBucket {
    /// Hash bucket entries
    pub entries: [AtomicHashBucketEntry; Self::NUM_ENTRIES],
    /// Overflow pointer to next bucket
    pub overflow_entry: AtomicHashBucketOverflowEntry,
}

impl HashBucket {
    /// Number of entries per bucket (excluding overflow)
    pub const NUM_ENTRIES: usize = 7;

    /// Serialized size of one bucket
    pub const SERIALIZED_SIZE: usize = 64;

    /// Create a new empty hash bucket
    pub const fn new() -> Self {
        Self {
            entries: [
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
            ],
            overflow_entry: AtomicHashBucketOverflowEntry::invalid(),
        }
    }

    /// Reset every word to zero.
    pub fn clear(&self) {
        for entry in &self.entries {
            entry.store(HashBucketEntry::INVALID, Ordering::Release);
        }
        self.overflow_entry
            .store(HashBucketOverflowEntry::INVALID, Ordering::Release);
    }

    /// Encode the bucket as eight little-endian words.
    pub fn write_to(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= Self::SERIALIZED_SIZE);
        for (i, entry) in self.entries.iter().enumerate() {
            let word = entry.load(Ordering::Acquire).control();
            dst[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        let overflow = self.overflow_entry.load(Ordering::Acquire).index();
        dst[56..64].copy_from_slice(&overflow.to_le_bytes());
    }

    /// Load the bucket from eight little-endian words.
    pub fn read_from(&self, src: &[u8]) {
        debug_assert!(src.len() >= Self::SERIALIZED_SIZE);
        for (i, entry) in self.entries.iter().enumerate() {
            entry.store(
                HashBucketEntry::from_control(read_word(src, i * 8)),
                Ordering::Release,
            );
        }
        self.overflow_entry.store(
            HashBucketOverflowEntry::new(read_word(src, 56)),
            Ordering::Release,
        );
    }
}

#[inline]
fn read_word(src: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&src[offset..offset + 8]);
    u64::from_le_bytes(word)
}

impl std::fmt::Debug for HashBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBucket")
            .field("entries", &self.entries)
            .field("overflow", &self.overflow_entry.load(Ordering::Relaxed))
            .finish()
    }
}
