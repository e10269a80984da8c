//! In-memory hash index
//!
//! Maps a key hash to the logical address of the newest record in that key's
//! chain. The table and its overflow pool form one table version; growing the
//! index swaps in a new version while the system is quiesced. Index operations
//! read the active version through a plain pointer load: the retired version
//! is only released by an epoch action, after every protected worker moved on.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::index::{AtomicHashBucketEntry, HashBucket, HashBucketEntry, InternalHashTable, KeyHash};

mod checkpoint;
mod grow;
mod ops;
mod overflow;

#[cfg(test)]
mod tests;

pub use checkpoint::{recovery_chunk_count, IndexSnapshot};
pub use grow::{GrowResult, TracedRecord};
pub(crate) use overflow::OverflowBucketPool;

/// Which bucket of a chain an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRef {
    /// Bucket in the main table
    Main(usize),
    /// Overflow bucket, by 1-based pool index
    Overflow(u64),
}

/// Location of one entry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlot {
    /// Bucket holding the entry
    pub bucket: BucketRef,
    /// Slot within the bucket
    pub slot: usize,
}

/// Result of a find operation
#[derive(Debug, Clone, Copy)]
pub struct FindResult {
    /// The entry found (or INVALID if not found)
    pub entry: HashBucketEntry,
    /// Where the entry lives
    pub slot: Option<EntrySlot>,
}

impl FindResult {
    /// Create a not-found result
    pub fn not_found() -> Self {
        Self {
            entry: HashBucketEntry::INVALID,
            slot: None,
        }
    }

    /// Check if an entry was found
    pub fn found(&self) -> bool {
        self.slot.is_some() && !self.entry.is_unused()
    }
}

/// Statistics about the hash index
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Total table size
    pub table_size: u64,
    /// Total entry slots, overflow buckets included
    pub total_entries: u64,
    /// Number of used entries
    pub used_entries: u64,
    /// Entries still marked tentative
    pub tentative_entries: u64,
    /// Number of main buckets with at least one entry
    pub buckets_with_entries: u64,
    /// Number of main buckets with an overflow chain
    pub buckets_with_overflow: u64,
    /// Overflow buckets allocated
    pub overflow_buckets: u64,
    /// Load factor (used / main slots)
    pub load_factor: f64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "buckets={} used={} overflow_buckets={} load={:.3}",
            self.table_size, self.used_entries, self.overflow_buckets, self.load_factor
        )
    }
}

/// One generation of the index: main table plus overflow pool.
pub(crate) struct TableVersion {
    pub(crate) table: InternalHashTable,
    pub(crate) overflow: OverflowBucketPool,
}

impl TableVersion {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            table: InternalHashTable::new(size),
            overflow: OverflowBucketPool::new(),
        }
    }

    pub(crate) fn bucket(&self, bucket: BucketRef) -> Option<&HashBucket> {
        match bucket {
            BucketRef::Main(idx) => Some(self.table.bucket_at(idx)),
            BucketRef::Overflow(idx) => self.overflow.get(idx),
        }
    }

    /// Run `f` on the atomic entry at `slot`.
    pub(crate) fn with_entry<R>(
        &self,
        slot: EntrySlot,
        f: impl FnOnce(&AtomicHashBucketEntry) -> R,
    ) -> Option<R> {
        let bucket = self.bucket(slot.bucket)?;
        bucket.entries.get(slot.slot).map(f)
    }

    /// Visit each bucket of the chain rooted at main bucket `index`.
    pub(crate) fn walk_chain<R>(
        &self,
        index: usize,
        mut f: impl FnMut(BucketRef, &HashBucket) -> ControlFlow<R>,
    ) -> Option<R> {
        let mut current = BucketRef::Main(index);
        loop {
            let bucket = self.bucket(current)?;
            if let ControlFlow::Break(r) = f(current, bucket) {
                return Some(r);
            }
            let next = bucket.overflow_entry.load(Ordering::Acquire);
            if next.is_unused() {
                return None;
            }
            current = BucketRef::Overflow(next.index());
        }
    }

    /// Visit every entry of every chain.
    pub(crate) fn for_each_entry(&self, mut f: impl FnMut(usize, &AtomicHashBucketEntry)) {
        for index in 0..self.table.size() as usize {
            self.walk_chain::<()>(index, |_, bucket| {
                for entry in bucket.entries.iter() {
                    f(index, entry);
                }
                ControlFlow::Continue(())
            });
        }
    }
}

/// In-memory hash index
pub struct MemHashIndex {
    /// Version read by index operations
    active: AtomicPtr<TableVersion>,
    /// Keeps the active version alive; only growth and cold paths touch it.
    owner: Mutex<Arc<TableVersion>>,
}

impl MemHashIndex {
    /// Create an index with `table_size` buckets (a power of two).
    pub fn new(table_size: u64) -> Self {
        let version = Arc::new(TableVersion::new(table_size));
        Self {
            active: AtomicPtr::new(Arc::as_ptr(&version).cast_mut()),
            owner: Mutex::new(version),
        }
    }

    /// Active version, for index operations on the hot path.
    ///
    /// Callers run under epoch protection whenever growth can happen
    /// concurrently; see [`Self::swap`].
    #[inline]
    pub(crate) fn active(&self) -> &TableVersion {
        // SAFETY: the pointee is owned by `owner` until a swap, and the version
        // a swap retires is dropped by an epoch action that waits for every
        // protected worker, so no protected reader can outlive it.
        unsafe { &*self.active.load(Ordering::Acquire) }
    }

    /// Owning handle of the active version, for paths that may run outside
    /// epoch protection or hand the version to other threads.
    pub(crate) fn current(&self) -> Arc<TableVersion> {
        Arc::clone(&self.owner.lock())
    }

    /// Install a new table version, returning the retired one.
    ///
    /// The caller must release the retired version through an epoch action.
    pub(crate) fn swap(&self, next: Arc<TableVersion>) -> Arc<TableVersion> {
        let mut owner = self.owner.lock();
        self.active
            .store(Arc::as_ptr(&next).cast_mut(), Ordering::Release);
        std::mem::replace(&mut *owner, next)
    }

    /// Number of buckets in the main table
    #[inline]
    pub fn size(&self) -> u64 {
        self.owner.lock().table.size()
    }

    /// Load factor of the main table
    pub fn load_factor(&self) -> f64 {
        self.dump_distribution().load_factor
    }
}

impl std::fmt::Debug for MemHashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemHashIndex")
            .field("size", &self.size())
            .finish()
    }
}

pub(crate) fn tag_matches(entry: HashBucketEntry, hash: KeyHash) -> bool {
    !entry.is_unused() && entry.tag() == hash.tag()
}
