use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::checkpoint::{CheckpointToken, IndexMetadata};
use crate::device::{read_exact, write_all, StorageDevice};
use crate::error::KvError;
use crate::index::HashBucket;
use crate::utility::{next_power_of_two, pad_alignment_u64, Countdown};

use super::{IndexStats, MemHashIndex};

const BUCKET_BYTES: u64 = HashBucket::SERIALIZED_SIZE as u64;

/// Copy of the index taken while the system is quiesced.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    /// Number of main buckets
    pub table_size: u64,
    /// Main buckets, 64 little-endian bytes each
    pub main: Vec<u8>,
    /// Overflow buckets in pool order
    pub overflow: Vec<u8>,
    /// Overflow pool free list
    pub free_list: Vec<u64>,
    /// Occupancy when the copy was taken
    pub stats: IndexStats,
}

impl MemHashIndex {
    /// Copy every main and overflow bucket into memory.
    pub fn snapshot(&self) -> IndexSnapshot {
        let version = self.current();
        let table_size = version.table.size();

        let mut main = vec![0u8; (table_size * BUCKET_BYTES) as usize];
        for (bucket, dst) in version
            .table
            .buckets()
            .iter()
            .zip(main.chunks_exact_mut(HashBucket::SERIALIZED_SIZE))
        {
            bucket.write_to(dst);
        }

        let pool = version.overflow.all();
        let mut overflow = vec![0u8; pool.len() * HashBucket::SERIALIZED_SIZE];
        for (bucket, dst) in pool
            .iter()
            .zip(overflow.chunks_exact_mut(HashBucket::SERIALIZED_SIZE))
        {
            bucket.write_to(dst);
        }

        IndexSnapshot {
            table_size,
            main,
            overflow,
            free_list: version.overflow.free_list(),
            stats: self.dump_distribution(),
        }
    }

    /// Restore the index from a checkpoint in `device`.
    ///
    /// Main buckets are read in parallel power-of-two chunks on `handle` and
    /// decoded straight into the live table; a countdown tracks the chunks.
    /// Tentative entries are deleted once everything has landed.
    pub fn recover<D: StorageDevice>(
        &self,
        meta: &IndexMetadata,
        device: Arc<D>,
        handle: &Handle,
        requested_chunks: u32,
    ) -> Result<u64, KvError> {
        let expected = self.size();
        if meta.table_size != expected {
            tracing::error!(
                expected,
                found = meta.table_size,
                "index checkpoint table size mismatch"
            );
            return Err(KvError::TableSizeMismatch {
                expected,
                found: meta.table_size,
            });
        }
        if meta.num_ht_bytes != expected * BUCKET_BYTES {
            return Err(KvError::Corruption(format!(
                "index checkpoint holds {} bytes for {} buckets",
                meta.num_ht_bytes, expected
            )));
        }

        let version = self.current();
        let num_chunks = recovery_chunk_count(meta.num_ht_bytes, expected, requested_chunks);
        let chunk_size = meta.num_ht_bytes / num_chunks;
        let countdown = Arc::new(Countdown::new(num_chunks as usize));
        let failures: Arc<Mutex<Vec<io::Error>>> = Arc::new(Mutex::new(Vec::new()));

        for chunk in 0..num_chunks {
            let device = Arc::clone(&device);
            let version = Arc::clone(&version);
            let countdown = Arc::clone(&countdown);
            let failures = Arc::clone(&failures);
            handle.spawn(async move {
                let offset = chunk * chunk_size;
                let mut buf = vec![0u8; chunk_size as usize];
                match read_exact(&*device, offset, &mut buf).await {
                    Ok(()) => {
                        let first = (offset / BUCKET_BYTES) as usize;
                        for (i, raw) in buf.chunks_exact(HashBucket::SERIALIZED_SIZE).enumerate() {
                            version.table.bucket_at(first + i).read_from(raw);
                        }
                    }
                    Err(e) => failures.lock().push(e),
                }
                countdown.signal();
            });
        }
        countdown.wait();

        if let Some(err) = failures.lock().pop() {
            return Err(KvError::Io(err));
        }

        let overflow_count = meta.num_overflow_buckets as usize;
        version
            .overflow
            .reset(overflow_count, meta.free_list.clone());
        if overflow_count > 0 {
            let mut buf = vec![0u8; meta.num_ofb_bytes as usize];
            handle.block_on(read_exact(&*device, meta.overflow_offset, &mut buf))?;
            for (i, raw) in buf.chunks_exact(HashBucket::SERIALIZED_SIZE).enumerate() {
                if let Some(bucket) = version.overflow.get(i as u64 + 1) {
                    bucket.read_from(raw);
                }
            }
        }

        let cleared = self.clear_tentative_entries();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                chunks = num_chunks,
                overflow_buckets = overflow_count,
                tentative_cleared = cleared,
                "index recovered"
            );
        }
        Ok(num_chunks)
    }
}

impl IndexSnapshot {
    /// Write the snapshot to `device` and describe it.
    ///
    /// Main buckets go at offset 0; the overflow region starts at the next
    /// sector boundary.
    pub async fn write_to<D: StorageDevice + ?Sized>(
        &self,
        device: &D,
        token: CheckpointToken,
    ) -> Result<IndexMetadata, KvError> {
        let sector = device.sector_size().max(1) as u64;
        let overflow_offset = pad_alignment_u64(self.main.len() as u64, sector);

        write_all(device, 0, &self.main).await?;
        if !self.overflow.is_empty() {
            write_all(device, overflow_offset, &self.overflow).await?;
        }
        device.flush().await?;

        Ok(IndexMetadata {
            token,
            table_size: self.table_size,
            num_buckets: self.stats.buckets_with_entries,
            num_entries: self.stats.used_entries,
            num_ht_bytes: self.main.len() as u64,
            overflow_offset,
            num_overflow_buckets: (self.overflow.len() / HashBucket::SERIALIZED_SIZE) as u64,
            num_ofb_bytes: self.overflow.len() as u64,
            free_list: self.free_list.clone(),
        })
    }
}

/// Number of chunks used to read `total_bytes` of main buckets.
///
/// At least `requested` (rounded up to a power of two), more if a chunk would
/// exceed a 32-bit transfer, and never more than one chunk per bucket.
pub fn recovery_chunk_count(total_bytes: u64, table_size: u64, requested: u32) -> u64 {
    let mut chunks = next_power_of_two(u64::from(requested.max(1)));
    while total_bytes / chunks > u64::from(u32::MAX) {
        chunks <<= 1;
    }
    chunks.min(table_size.max(1))
}
