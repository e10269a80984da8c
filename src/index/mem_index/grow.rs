use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::address::Address;
use crate::index::{HashBucketEntry, KeyHash};

use super::ops::{append_overflow_bucket, find_free_slot};
use super::{MemHashIndex, TableVersion};

/// What the caller learns from tracing one in-memory record during growth.
#[derive(Debug, Clone, Copy)]
pub struct TracedRecord {
    /// Hash of the record's key
    pub hash: KeyHash,
    /// Previous address in the record's chain
    pub previous: Address,
}

/// Result of doubling the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowResult {
    /// Buckets before growth
    pub old_size: u64,
    /// Buckets after growth
    pub new_size: u64,
    /// Entries written into the new table
    pub entries_migrated: u64,
}

impl MemHashIndex {
    /// Double the table, migrating every committed entry.
    ///
    /// Must run while no worker is inside an index operation. Old bucket `i`
    /// splits into `i` and `i + old_size`. `trace` resolves an in-memory record
    /// to its key hash and predecessor; it returns `None` for addresses that are
    /// not resident, in which case both halves keep that on-disk address.
    ///
    /// Returns the retired table version so the caller can release it through
    /// an epoch action.
    pub(crate) fn grow<F>(&self, trace: F) -> (GrowResult, Arc<TableVersion>)
    where
        F: Fn(Address) -> Option<TracedRecord>,
    {
        let old = self.current();
        let old_size = old.table.size();
        let next = Arc::new(TableVersion::new(old_size * 2));
        let mut migrated = 0u64;

        for index in 0..old_size as usize {
            old.walk_chain::<()>(index, |_, bucket| {
                for atomic in bucket.entries.iter() {
                    let entry = atomic.load(Ordering::Acquire);
                    if entry.is_unused() || entry.is_tentative() {
                        continue;
                    }
                    let (low, high) = split_chain(entry.address(), old_size, &trace);
                    if let Some(address) = low {
                        insert_quiesced(&next, index, HashBucketEntry::new(address, entry.tag(), false));
                        migrated += 1;
                    }
                    if let Some(address) = high {
                        insert_quiesced(
                            &next,
                            index + old_size as usize,
                            HashBucketEntry::new(address, entry.tag(), false),
                        );
                        migrated += 1;
                    }
                }
                ControlFlow::Continue(())
            });
        }

        let retired = self.swap(next);
        (
            GrowResult {
                old_size,
                new_size: old_size * 2,
                entries_migrated: migrated,
            },
            retired,
        )
    }
}

/// Newest address belonging to each half of a split bucket.
fn split_chain<F>(head: Address, old_size: u64, trace: &F) -> (Option<Address>, Option<Address>)
where
    F: Fn(Address) -> Option<TracedRecord>,
{
    let mut low = None;
    let mut high = None;
    let mut cursor = head;

    while (low.is_none() || high.is_none()) && cursor >= Address::FIRST_VALID {
        match trace(cursor) {
            Some(record) => {
                let half = if record.hash.hash() & old_size != 0 {
                    &mut high
                } else {
                    &mut low
                };
                if half.is_none() {
                    *half = Some(cursor);
                }
                cursor = record.previous;
            }
            None => {
                low.get_or_insert(cursor);
                high.get_or_insert(cursor);
                break;
            }
        }
    }
    (low, high)
}

fn insert_quiesced(version: &TableVersion, index: usize, entry: HashBucketEntry) {
    loop {
        if let Some(slot) = find_free_slot(version, index) {
            let stored = version
                .with_entry(slot, |e| e.compare_exchange(HashBucketEntry::INVALID, entry).is_ok())
                .unwrap_or(false);
            if stored {
                return;
            }
        } else {
            append_overflow_bucket(version, index);
        }
    }
}
