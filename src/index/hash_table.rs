//! Main bucket array of the hash index

use crate::index::{HashBucket, KeyHash};

/// A power-of-two sized array of [`HashBucket`]s
pub struct InternalHashTable {
    buckets: Box<[HashBucket]>,
    size: u64,
}

impl InternalHashTable {
    /// Allocate a zeroed table of `size` buckets.
    ///
    /// `size` must be a power of two; the caller validates it.
    pub fn new(size: u64) -> Self {
        debug_assert!(size.is_power_of_two());
        let buckets: Vec<HashBucket> = (0..size).map(|_| HashBucket::new()).collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            size,
        }
    }

    /// Number of buckets
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bucket index for the given hash
    #[inline]
    pub fn index_of(&self, hash: KeyHash) -> usize {
        hash.hash_table_index(self.size)
    }

    /// Get the bucket for the given hash
    #[inline]
    pub fn bucket(&self, hash: KeyHash) -> &HashBucket {
        &self.buckets[self.index_of(hash)]
    }

    /// Get the bucket at `index`
    #[inline]
    pub fn bucket_at(&self, index: usize) -> &HashBucket {
        &self.buckets[index]
    }

    /// All buckets in index order
    #[inline]
    pub fn buckets(&self) -> &[HashBucket] {
        &self.buckets
    }

    /// Reset every bucket.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }
}

impl std::fmt::Debug for InternalHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalHashTable")
            .field("size", &self.size)
            .finish()
    }
}
