//! Concurrent hash index
//!
//! Maps key hashes to the newest record address of each chain. Insertion is
//! two-phase: a tentative entry is installed with CAS, checked for same-tag
//! conflicts, then confirmed.

mod hash_bucket;
mod hash_table;
mod mem_index;

pub use hash_bucket::{
    AtomicHashBucketEntry, AtomicHashBucketOverflowEntry, HashBucket, HashBucketEntry,
    HashBucketOverflowEntry,
};
pub use hash_table::InternalHashTable;
pub use mem_index::{
    recovery_chunk_count, BucketRef, EntrySlot, FindResult, GrowResult, IndexSnapshot, IndexStats,
    MemHashIndex, TracedRecord,
};

/// Key hash type for index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Number of bits used for the tag
    pub const TAG_BITS: u32 = HashBucketEntry::TAG_BITS;

    /// Create a new key hash
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Bucket index for a table of `size` buckets (low bits)
    #[inline]
    pub const fn hash_table_index(&self, size: u64) -> usize {
        (self.hash & (size - 1)) as usize
    }

    /// Tag stored in the bucket entry (bits 48..62)
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.hash >> 48) & ((1 << Self::TAG_BITS) - 1)) as u16
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}
