use std::ops::ControlFlow;
use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::index::{HashBucket, HashBucketEntry, HashBucketOverflowEntry, KeyHash};

use super::{tag_matches, BucketRef, EntrySlot, FindResult, IndexStats, MemHashIndex, TableVersion};

impl MemHashIndex {
    /// Find the committed entry for `hash`.
    ///
    /// Tentative entries are invisible here.
    pub fn find_entry(&self, hash: KeyHash) -> FindResult {
        let version = self.active();
        find_in_chain(version, hash)
    }

    /// Install a tentative entry for `hash` pointing at an already appended record.
    ///
    /// Fails when a committed entry for the tag already exists (the caller
    /// should chain onto it instead) or when another writer raced in with the
    /// same tag. On failure the caller retries from a fresh lookup.
    pub fn try_insert_tentative(&self, hash: KeyHash, address: Address) -> Option<EntrySlot> {
        let version = self.active();
        let index = version.table.index_of(hash);
        let tentative = HashBucketEntry::new(address, hash.tag(), true);

        loop {
            if find_in_chain(version, hash).found() {
                return None;
            }

            let free = match find_free_slot(version, index) {
                Some(slot) => slot,
                None => {
                    append_overflow_bucket(version, index);
                    continue;
                }
            };

            let installed = version
                .with_entry(free, |e| e.compare_exchange(HashBucketEntry::INVALID, tentative))
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !installed {
                continue;
            }

            if has_conflict(version, index, hash, free) {
                version.with_entry(free, |e| e.store(HashBucketEntry::INVALID, Ordering::Release));
                return None;
            }
            return Some(free);
        }
    }

    /// Clear the tentative bit of an entry installed by [`Self::try_insert_tentative`].
    pub fn confirm_entry(&self, hash: KeyHash, slot: EntrySlot) -> bool {
        let version = self.active();
        version
            .with_entry(slot, |e| {
                let prev = e.clear_tentative();
                prev.is_tentative() && prev.tag() == hash.tag()
            })
            .unwrap_or(false)
    }

    /// Remove a tentative entry that will never be confirmed.
    pub fn abandon_entry(&self, slot: EntrySlot) {
        let version = self.active();
        version.with_entry(slot, |e| {
            let current = e.load(Ordering::Acquire);
            if current.is_tentative() {
                let _ = e.compare_exchange(current, HashBucketEntry::INVALID);
            }
        });
    }

    /// Swing the committed entry for `hash` from `old` to `new`.
    pub fn update_entry(&self, hash: KeyHash, old: Address, new: Address) -> bool {
        let version = self.active();
        let found = find_in_chain(version, hash);
        if !found.found() || found.entry.address() != old {
            return false;
        }
        cas_entry(version, &found, new)
    }

    /// Swing the exact entry from a previous lookup to `new`.
    ///
    /// Fails if anything changed the entry since the lookup.
    pub fn try_update(&self, found: &FindResult, new: Address) -> bool {
        let version = self.active();
        cas_entry(version, found, new)
    }

    /// Clear committed entries pointing below `begin`. Returns how many were cleared.
    pub fn garbage_collect(&self, begin: Address) -> u64 {
        let version = self.current();
        let mut cleared = 0;
        version.for_each_entry(|_, atomic| {
            let entry = atomic.load(Ordering::Acquire);
            if !entry.is_unused()
                && !entry.is_tentative()
                && entry.address() < begin
                && atomic
                    .compare_exchange(entry, HashBucketEntry::INVALID)
                    .is_ok()
            {
                cleared += 1;
            }
        });
        cleared
    }

    /// Delete every tentative entry, overflow chains included.
    pub fn clear_tentative_entries(&self) -> u64 {
        let version = self.current();
        let mut cleared = 0;
        version.for_each_entry(|_, atomic| {
            if atomic.load(Ordering::Acquire).is_tentative() {
                atomic.store(HashBucketEntry::INVALID, Ordering::Release);
                cleared += 1;
            }
        });
        cleared
    }

    /// Collect occupancy statistics.
    pub fn dump_distribution(&self) -> IndexStats {
        let version = self.current();
        let table_size = version.table.size();
        let mut stats = IndexStats {
            table_size,
            overflow_buckets: version.overflow.len() as u64,
            ..IndexStats::default()
        };

        for index in 0..table_size as usize {
            let mut used_in_chain = 0u64;
            let mut chain_len = 0u64;
            version.walk_chain::<()>(index, |_, bucket| {
                chain_len += 1;
                for atomic in bucket.entries.iter() {
                    stats.total_entries += 1;
                    let entry = atomic.load(Ordering::Relaxed);
                    if !entry.is_unused() {
                        used_in_chain += 1;
                        if entry.is_tentative() {
                            stats.tentative_entries += 1;
                        }
                    }
                }
                ControlFlow::Continue(())
            });
            stats.used_entries += used_in_chain;
            if used_in_chain > 0 {
                stats.buckets_with_entries += 1;
            }
            if chain_len > 1 {
                stats.buckets_with_overflow += 1;
            }
        }

        let main_slots = table_size * HashBucket::NUM_ENTRIES as u64;
        stats.load_factor = stats.used_entries as f64 / main_slots as f64;
        stats
    }
}

pub(super) fn find_in_chain(version: &TableVersion, hash: KeyHash) -> FindResult {
    version
        .walk_chain(version.table.index_of(hash), |bucket_ref, bucket| {
            for (slot, atomic) in bucket.entries.iter().enumerate() {
                let entry = atomic.load(Ordering::Acquire);
                if tag_matches(entry, hash) && !entry.is_tentative() {
                    return ControlFlow::Break(FindResult {
                        entry,
                        slot: Some(EntrySlot {
                            bucket: bucket_ref,
                            slot,
                        }),
                    });
                }
            }
            ControlFlow::Continue(())
        })
        .unwrap_or_else(FindResult::not_found)
}

pub(super) fn find_free_slot(version: &TableVersion, index: usize) -> Option<EntrySlot> {
    version.walk_chain(index, |bucket_ref, bucket| {
        for (slot, atomic) in bucket.entries.iter().enumerate() {
            if atomic.load(Ordering::Acquire).is_unused() {
                return ControlFlow::Break(EntrySlot {
                    bucket: bucket_ref,
                    slot,
                });
            }
        }
        ControlFlow::Continue(())
    })
}

/// Link a fresh overflow bucket at the end of the chain rooted at `index`.
///
/// Losing the link race returns the bucket to the pool; either way the chain
/// has grown by the time this returns.
pub(super) fn append_overflow_bucket(version: &TableVersion, index: usize) {
    let mut current = BucketRef::Main(index);
    loop {
        let Some(bucket) = version.bucket(current) else {
            return;
        };
        let next = bucket.overflow_entry.load(Ordering::Acquire);
        if !next.is_unused() {
            current = BucketRef::Overflow(next.index());
            continue;
        }

        let fresh = version.overflow.allocate();
        match bucket
            .overflow_entry
            .compare_exchange(HashBucketOverflowEntry::INVALID, HashBucketOverflowEntry::new(fresh))
        {
            Ok(_) => return,
            Err(_) => {
                version.overflow.deallocate(fresh);
                return;
            }
        }
    }
}

fn has_conflict(version: &TableVersion, index: usize, hash: KeyHash, mine: EntrySlot) -> bool {
    version
        .walk_chain(index, |bucket_ref, bucket| {
            for (slot, atomic) in bucket.entries.iter().enumerate() {
                let here = EntrySlot {
                    bucket: bucket_ref,
                    slot,
                };
                if here != mine && tag_matches(atomic.load(Ordering::Acquire), hash) {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        })
        .is_some()
}

fn cas_entry(version: &TableVersion, found: &FindResult, new: Address) -> bool {
    let Some(slot) = found.slot else {
        return false;
    };
    version
        .with_entry(slot, |e| {
            e.compare_exchange(found.entry, found.entry.with_address(new))
                .is_ok()
        })
        .unwrap_or(false)
}
