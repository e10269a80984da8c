use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::index::HashBucket;

/// Buckets in the first segment; each later segment doubles.
const FIRST_SEGMENT: u64 = 64;
const SEGMENTS: usize = 32;

/// Pool of overflow buckets for one table version.
///
/// Buckets are addressed by a 1-based index so that zero can mean "no
/// overflow". They live in segments of doubling size that are allocated once
/// and never move, so a lookup is two loads with no lock. Linked buckets are
/// never returned to the free list; only buckets that lost the race to be
/// linked are.
pub(crate) struct OverflowBucketPool {
    segments: [OnceLock<Box<[HashBucket]>>; SEGMENTS],
    allocated: AtomicU64,
    free_list: Mutex<Vec<u64>>,
}

/// Segment and offset of the 0-based bucket `slot`.
fn locate(slot: u64) -> Option<(usize, usize)> {
    let group = slot / FIRST_SEGMENT + 1;
    let segment = (63 - group.leading_zeros()) as usize;
    if segment >= SEGMENTS {
        return None;
    }
    let start = FIRST_SEGMENT * ((1 << segment) - 1);
    Some((segment, (slot - start) as usize))
}

impl OverflowBucketPool {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            allocated: AtomicU64::new(0),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Replace the contents with `count` empty buckets and the given free list.
    ///
    /// Only valid while no worker can be walking a chain.
    pub(crate) fn reset(&self, count: usize, free_list: Vec<u64>) {
        self.allocated.store(count as u64, Ordering::Release);
        for index in 1..=count as u64 {
            if let Some(bucket) = self.slot(index) {
                bucket.clear();
            }
        }
        *self.free_list.lock() = free_list;
    }

    /// Number of buckets ever allocated (free or linked).
    pub(crate) fn len(&self) -> usize {
        self.allocated.load(Ordering::Acquire) as usize
    }

    /// Allocate an empty bucket and return its 1-based index.
    pub(crate) fn allocate(&self) -> u64 {
        if let Some(index) = self.free_list.lock().pop() {
            if let Some(bucket) = self.get(index) {
                bucket.clear();
                return index;
            }
        }

        let index = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        // A reset may have left stale words past the recovered count.
        if let Some(bucket) = self.slot(index) {
            bucket.clear();
        }
        index
    }

    /// Return a bucket that was never linked into a chain.
    pub(crate) fn deallocate(&self, index: u64) {
        if let Some(bucket) = self.get(index) {
            bucket.clear();
            self.free_list.lock().push(index);
        }
    }

    /// Look up an allocated bucket by its 1-based index.
    pub(crate) fn get(&self, index: u64) -> Option<&HashBucket> {
        if index == 0 || index > self.allocated.load(Ordering::Acquire) {
            return None;
        }
        let (segment, offset) = locate(index - 1)?;
        self.segments[segment].get()?.get(offset)
    }

    /// Bucket backing `index`, creating its segment if needed.
    fn slot(&self, index: u64) -> Option<&HashBucket> {
        let (segment, offset) = locate(index.checked_sub(1)?)?;
        let buckets = self.segments[segment].get_or_init(|| {
            let len = FIRST_SEGMENT << segment;
            (0..len).map(|_| HashBucket::new()).collect()
        });
        buckets.get(offset)
    }

    /// Every allocated bucket in index order.
    pub(crate) fn all(&self) -> Vec<&HashBucket> {
        (1..=self.len() as u64).filter_map(|i| self.get(i)).collect()
    }

    /// Snapshot of the free list.
    pub(crate) fn free_list(&self) -> Vec<u64> {
        self.free_list.lock().clone()
    }
}

impl Default for OverflowBucketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::OverflowBucketPool;
    use crate::address::Address;
    use crate::index::HashBucketEntry;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_pool_reuses_deallocated_index() {
        let pool = OverflowBucketPool::new();

        let a1 = pool.allocate();
        let a2 = pool.allocate();
        assert_eq!((a1, a2), (1, 2));

        pool.get(a2).unwrap().entries[0].store(
            HashBucketEntry::new(Address::new(64), 1, false),
            Ordering::Release,
        );
        pool.deallocate(a2);
        assert_eq!(pool.free_list(), vec![2]);

        let a3 = pool.allocate();
        assert_eq!(a3, a2);
        assert!(pool.free_list().is_empty());
        let bucket = pool.get(a3).unwrap();
        assert!(bucket
            .entries
            .iter()
            .all(|e| e.load(Ordering::Acquire).is_unused()));
    }

    #[test]
    fn test_segments_cover_consecutive_indexes() {
        assert_eq!(super::locate(0), Some((0, 0)));
        assert_eq!(super::locate(63), Some((0, 63)));
        assert_eq!(super::locate(64), Some((1, 0)));
        assert_eq!(super::locate(191), Some((1, 127)));
        assert_eq!(super::locate(192), Some((2, 0)));

        let pool = OverflowBucketPool::new();
        let indexes: Vec<u64> = (0..500).map(|_| pool.allocate()).collect();
        assert_eq!(indexes, (1..=500).collect::<Vec<_>>());
        assert_eq!(pool.len(), 500);
        assert_eq!(pool.all().len(), 500);

        // Distinct indexes never share a bucket.
        for index in [1u64, 64, 65, 192, 193, 500] {
            pool.get(index).unwrap().entries[0].store(
                HashBucketEntry::new(Address::new(64 * index), 1, false),
                Ordering::Release,
            );
        }
        for index in [1u64, 64, 65, 192, 193, 500] {
            let entry = pool.get(index).unwrap().entries[0].load(Ordering::Acquire);
            assert_eq!(entry.address(), Address::new(64 * index));
        }
        assert!(pool.get(501).is_none());
    }

    #[test]
    fn test_reset_clears_recovered_range() {
        let pool = OverflowBucketPool::new();
        for _ in 0..3 {
            pool.allocate();
        }
        pool.get(3).unwrap().entries[2].store(
            HashBucketEntry::new(Address::new(128), 5, false),
            Ordering::Release,
        );

        pool.reset(2, vec![1]);
        assert_eq!(pool.len(), 2);
        assert!(pool.get(3).is_none());
        assert_eq!(pool.allocate(), 1);
        // Index 3 is handed out again, emptied.
        assert_eq!(pool.allocate(), 3);
        assert!(pool.get(3).unwrap().entries[2].load(Ordering::Acquire).is_unused());
    }

    #[test]
    fn test_zero_index_is_none() {
        let pool = OverflowBucketPool::new();
        assert!(pool.get(0).is_none());
        assert!(pool.get(1).is_none());
        pool.allocate();
        assert!(pool.get(1).is_some());
    }
}
