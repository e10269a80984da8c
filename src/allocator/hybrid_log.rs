//! Hybrid log allocator
//!
//! The log is a single logical address space. The resident suffix lives in a
//! ring of page frames; everything below the head address only exists on the
//! device.
//!
//! ```text
//! begin          head            read_only          tail
//!   |  on disk    |   read-only    |     mutable      |
//! ```
//!
//! Boundary moves follow the same pattern: the unsafe marker (`read_only`,
//! `head`) moves first, then an epoch action moves the matching safe marker
//! once no worker can still act on the old value. The read-only action flushes
//! the newly immutable range; the head action clears evicted frames.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, AtomicTailOffset, LogGeometry, TailOffset};
use crate::allocator::page_allocator::{PageArena, PageFrame};
use crate::device::{read_exact, StorageDevice};
use crate::epoch::LightEpoch;
use crate::error::KvError;
use crate::record::{RecordHeader, RecordInfo, RECORD_HEADER_SIZE};
use crate::status::OperationStatus;

/// Sizing of the hybrid log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridLogConfig {
    /// log2 of the page size
    pub page_bits: u32,
    /// log2 of the device segment size
    pub segment_bits: u32,
    /// Number of resident page frames (at least 2)
    pub memory_pages: u64,
    /// Full pages behind the tail page that stay mutable
    pub mutable_pages: u64,
}

impl HybridLogConfig {
    /// Derive page counts from a memory budget and the mutable fraction.
    ///
    /// The mutable region is capped so that one frame is always free for the
    /// next page and one page is always in flight to the device.
    pub fn new(
        log_memory_size: u64,
        page_bits: u32,
        segment_bits: u32,
        mutable_fraction: f64,
    ) -> Self {
        let memory_pages = (log_memory_size >> page_bits).max(2);
        let wanted = (memory_pages as f64 * mutable_fraction).floor() as u64;
        Self {
            page_bits,
            segment_bits,
            memory_pages,
            mutable_pages: wanted.min(memory_pages - 2),
        }
    }

    /// Page and segment arithmetic for this configuration.
    pub fn geometry(&self) -> LogGeometry {
        LogGeometry::new(self.page_bits, self.segment_bits)
    }
}

/// The hybrid log.
pub struct HybridLog<D: StorageDevice> {
    config: HybridLogConfig,
    geometry: LogGeometry,
    arena: PageArena,
    epoch: Arc<LightEpoch>,
    device: Arc<D>,
    object_device: Option<Arc<dyn StorageDevice>>,
    object_tail: AtomicU64,

    tail: AtomicTailOffset,
    read_only_address: AtomicAddress,
    safe_read_only_address: AtomicAddress,
    head_address: AtomicAddress,
    safe_head_address: AtomicAddress,
    flushed_until_address: AtomicAddress,
    begin_address: AtomicAddress,
    /// Where page turns want the head to be once the flush catches up
    head_target: AtomicAddress,
    /// Head never passes this while a snapshot copies from memory
    head_pin: AtomicAddress,

    flush_lock: Mutex<()>,
    evict_lock: Mutex<()>,
    flush_failures: AtomicU64,
    io_runtime: tokio::runtime::Runtime,
    me: Weak<Self>,
}

const UNPINNED: Address = Address::new(Address::MAX_ADDRESS);

impl<D: StorageDevice> HybridLog<D> {
    /// Create an empty log whose first record goes to [`Address::FIRST_VALID`].
    pub fn new(
        config: HybridLogConfig,
        device: Arc<D>,
        object_device: Option<Arc<dyn StorageDevice>>,
        epoch: Arc<LightEpoch>,
    ) -> Result<Arc<Self>, KvError> {
        let io_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let geometry = config.geometry();
        let start = Address::FIRST_VALID;

        Ok(Arc::new_cyclic(|me| Self {
            config,
            geometry,
            arena: PageArena::new(config.memory_pages as usize, config.page_bits),
            epoch,
            device,
            object_device,
            object_tail: AtomicU64::new(0),
            tail: AtomicTailOffset::new(TailOffset::from_address(start, &geometry)),
            read_only_address: AtomicAddress::new(start),
            safe_read_only_address: AtomicAddress::new(start),
            head_address: AtomicAddress::new(start),
            safe_head_address: AtomicAddress::new(start),
            flushed_until_address: AtomicAddress::new(start),
            begin_address: AtomicAddress::new(start),
            head_target: AtomicAddress::new(start),
            head_pin: AtomicAddress::new(UNPINNED),
            flush_lock: Mutex::new(()),
            evict_lock: Mutex::new(()),
            flush_failures: AtomicU64::new(0),
            io_runtime,
            me: me.clone(),
        }))
    }

    /// Sizing this log was built with.
    #[inline]
    pub fn config(&self) -> &HybridLogConfig {
        &self.config
    }

    /// Page and segment arithmetic.
    #[inline]
    pub fn geometry(&self) -> &LogGeometry {
        &self.geometry
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.geometry.page_size()
    }

    /// Main log device.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Object log device, when records keep their payload out of line on disk.
    #[inline]
    pub fn object_device(&self) -> Option<&Arc<dyn StorageDevice>> {
        self.object_device.as_ref()
    }

    /// Next free offset in the object log.
    #[inline]
    pub fn object_log_tail(&self) -> u64 {
        self.object_tail.load(Ordering::Acquire)
    }

    /// First address handed out to the next allocation.
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.tail.load(Ordering::Acquire).to_address(&self.geometry)
    }

    /// Start of the mutable region.
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    /// Read-only boundary every worker has observed.
    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    /// Lowest resident address.
    #[inline]
    pub fn head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    /// Lowest address whose frame has not been cleared.
    #[inline]
    pub fn safe_head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    /// Everything below this address is durable on the main device.
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    /// Lowest live address.
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    /// Whether `address` may be updated in place.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.read_only_address()
    }

    /// Whether `address` lies between the safe and the announced read-only
    /// boundary, where a worker that has not seen the shift may still write it.
    #[inline]
    pub fn is_fuzzy(&self, address: Address) -> bool {
        address >= self.safe_read_only_address() && address < self.read_only_address()
    }

    /// Whether `address` requires a device read.
    #[inline]
    pub fn is_on_disk(&self, address: Address) -> bool {
        address < self.head_address()
    }

    /// Number of flushes that failed since the log was opened.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Acquire)
    }

    /// Reserve `size` bytes at the tail.
    ///
    /// Returns `RetryLater` when the next page's frame is still occupied; the
    /// caller must refresh its epoch so pending flush and eviction actions can
    /// run, then try again.
    pub(crate) fn allocate(&self, size: u32) -> Result<Address, OperationStatus> {
        let page_size = self.page_size();
        if u64::from(size) > page_size || size % 8 != 0 {
            return Err(OperationStatus::Failed);
        }

        loop {
            let current = self.tail.load(Ordering::Acquire);
            if current.offset() + u64::from(size) > page_size {
                self.turn_page(current.page())?;
                continue;
            }

            let reserved = self.tail.reserve(size);
            if reserved.offset() + u64::from(size) <= page_size {
                return Ok(self.geometry.page_start(reserved.page()) + reserved.offset());
            }
            // Lost the end of the page to a concurrent reservation.
        }
    }

    fn turn_page(&self, page: u64) -> Result<(), OperationStatus> {
        let next = page + 1;
        if !self.frame_available(next) {
            self.try_shift_head();
            return Err(OperationStatus::RetryLater);
        }
        let (_, won) = self.tail.new_page(page);
        if won {
            self.on_page_opened(next);
        }
        Ok(())
    }

    /// The frame for `page` is free once the page `memory_pages` earlier is evicted.
    #[inline]
    fn frame_available(&self, page: u64) -> bool {
        let frames = self.arena.frames();
        page < frames
            || self.safe_head_address() >= self.geometry.page_start(page + 1 - frames)
    }

    fn on_page_opened(&self, page: u64) {
        let read_only = self
            .geometry
            .page_start(page.saturating_sub(self.config.mutable_pages));
        let head = self
            .geometry
            .page_start((page + 2).saturating_sub(self.config.memory_pages));
        self.head_target.fetch_max(head);
        self.shift_read_only_address(read_only);
        self.try_shift_head();
    }

    /// Raise the read-only boundary.
    ///
    /// The newly immutable range is flushed by an epoch action once every
    /// worker has seen the new boundary. Returns whether the boundary moved.
    pub fn shift_read_only_address(&self, target: Address) -> bool {
        let target = target.min(self.tail_address());
        if self.read_only_address.fetch_max(target).is_none() {
            return false;
        }
        let log = self.me.clone();
        self.epoch.bump_current_epoch_with_action(move || {
            if let Some(log) = log.upgrade() {
                log.on_safe_read_only(target);
            }
        });
        true
    }

    fn on_safe_read_only(&self, target: Address) {
        self.safe_read_only_address.fetch_max(target);
        self.flush_until(target);
        self.try_shift_head();
    }

    /// Raise the head address, never past the flushed or pinned boundary.
    ///
    /// Frames below the new head are cleared by an epoch action. Returns
    /// whether the head moved.
    pub fn shift_head_address(&self, target: Address) -> bool {
        let target = target
            .min(self.flushed_until_address())
            .min(self.head_pin.load(Ordering::Acquire));
        if self.head_address.fetch_max(target).is_none() {
            return false;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(head = %target, "head address shifted");
        }
        let log = self.me.clone();
        self.epoch.bump_current_epoch_with_action(move || {
            if let Some(log) = log.upgrade() {
                log.evict_until(target);
            }
        });
        true
    }

    fn try_shift_head(&self) {
        self.shift_head_address(self.head_target.load(Ordering::Acquire));
    }

    fn evict_until(&self, target: Address) {
        let _guard = self.evict_lock.lock();
        let safe = self.safe_head_address();
        if target <= safe {
            return;
        }
        let last = self.geometry.page(target);
        let first = self
            .geometry
            .page(safe)
            .max(last.saturating_sub(self.arena.frames()));
        for page in first..last {
            self.arena.frame(page).clear();
        }
        self.safe_head_address.fetch_max(target);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(pages = last.saturating_sub(first), safe_head = %target, "evicted pages");
        }
    }

    /// Keep the head at or below `address` until [`HybridLog::unpin_head`].
    pub(crate) fn pin_head(&self, address: Address) {
        self.head_pin.store(address, Ordering::Release);
    }

    /// Release a head pin and catch up with the pending head target.
    pub(crate) fn unpin_head(&self) {
        self.head_pin.store(UNPINNED, Ordering::Release);
        self.try_shift_head();
    }

    /// Move the begin address forward and release device storage below it.
    ///
    /// If the new begin passes the head, the resident region is flushed and
    /// evicted up to it first. Returns the previous begin address, or `None`
    /// when `target` is not ahead of it.
    pub fn shift_begin_address(&self, target: Address) -> Result<Option<Address>, KvError> {
        let target = target.min(self.tail_address());
        let Some(previous) = self.begin_address.fetch_max(target) else {
            return Ok(None);
        };
        if target > self.head_address() {
            self.flush_and_evict(target)?;
        }
        self.device.remove_until(target.control())?;
        tracing::info!(from = %previous, to = %target, "log begin address shifted");
        Ok(Some(previous))
    }

    /// Flush everything below `until` and evict it from memory, waiting for both.
    ///
    /// Must not be called by a worker that is currently epoch protected.
    pub fn flush_and_evict(&self, until: Address) -> Result<(), KvError> {
        let until = until.min(self.tail_address());
        let failures = self.flush_failures();
        self.head_target.fetch_max(until);
        self.shift_read_only_address(until);
        self.wait_for(failures, || self.flushed_until_address() >= until)?;
        self.try_shift_head();
        let pin = self.head_pin.load(Ordering::Acquire);
        self.wait_for(failures, || self.safe_head_address() >= until.min(pin))
    }

    /// Flush everything below `until` without evicting it.
    pub fn flush_to(&self, until: Address) -> Result<(), KvError> {
        let until = until.min(self.tail_address());
        let failures = self.flush_failures();
        self.shift_read_only_address(until);
        self.wait_for(failures, || self.flushed_until_address() >= until)
    }

    /// Drain epoch actions until `done` holds.
    ///
    /// A flush that failed is retried once up to the safe read-only boundary;
    /// any failure after `failures` was sampled is reported.
    fn wait_for(&self, failures: u64, done: impl Fn() -> bool) -> Result<(), KvError> {
        loop {
            self.epoch.drain(self.epoch.current_epoch());
            if self.flush_failures() > failures {
                return Err(KvError::Io(io::Error::other("log flush failed")));
            }
            if done() {
                return Ok(());
            }
            self.flush_until(self.safe_read_only_address());
            if self.flush_failures() > failures {
                return Err(KvError::Io(io::Error::other("log flush failed")));
            }
            thread::yield_now();
        }
    }

    /// Reset the log after recovery: all recovered records are on the device.
    pub(crate) fn restore(&self, begin: Address, final_address: Address, object_tail: u64) {
        for page in 0..self.arena.frames() {
            self.arena.frame(page).clear();
        }
        self.begin_address.store(begin, Ordering::Release);
        for boundary in [
            &self.head_address,
            &self.safe_head_address,
            &self.read_only_address,
            &self.safe_read_only_address,
            &self.flushed_until_address,
            &self.head_target,
        ] {
            boundary.store(final_address, Ordering::Release);
        }
        self.tail.store(
            TailOffset::from_address(final_address, &self.geometry),
            Ordering::Release,
        );
        self.object_tail.store(object_tail, Ordering::Release);
    }

    #[inline]
    fn locate(&self, address: Address, len: usize) -> Option<(&PageFrame, usize)> {
        if address < self.safe_head_address() {
            return None;
        }
        let offset = self.geometry.offset(address) as usize;
        if offset + len > self.arena.page_size() {
            return None;
        }
        Some((self.arena.frame(self.geometry.page(address)), offset))
    }

    /// Header word of the resident record at `address`.
    #[inline]
    pub(crate) fn info_word(&self, address: Address) -> Option<&AtomicU64> {
        let (frame, offset) = self.locate(address, RECORD_HEADER_SIZE)?;
        frame.word(offset)
    }

    /// Header of the resident record at `address`.
    pub(crate) fn record_header(&self, address: Address) -> Option<RecordHeader> {
        let (frame, offset) = self.locate(address, RECORD_HEADER_SIZE)?;
        let info = frame.word(offset)?.load(Ordering::Acquire);
        let lengths = frame.word(offset + 8)?.load(Ordering::Acquire);
        let header = RecordHeader::from_words(info, lengths);
        if header.info.is_null() || offset + header.record_size() > self.arena.page_size() {
            return None;
        }
        Some(header)
    }

    fn read_range(
        &self,
        address: Address,
        header: &RecordHeader,
        range: std::ops::Range<usize>,
    ) -> Option<Vec<u8>> {
        let (frame, offset) = self.locate(address, header.record_size())?;
        let mut buf = vec![0u8; range.len()];
        frame.read_bytes(offset + range.start, &mut buf)?;
        Some(buf)
    }

    /// Read `len` bytes of the main device at `address`.
    pub(crate) fn read_durable(&self, address: Address, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.io_runtime
            .block_on(read_exact(&*self.device, address.control(), &mut buf))?;
        Ok(buf)
    }

    /// Read `len` bytes of the object log at `offset`.
    pub(crate) fn read_object(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let objects = self
            .object_device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log has no object device"))?;
        let mut buf = vec![0u8; len];
        self.io_runtime
            .block_on(read_exact(&**objects, offset, &mut buf))?;
        Ok(buf)
    }

    /// Key bytes of the resident record at `address`.
    pub(crate) fn read_key(&self, address: Address, header: &RecordHeader) -> Option<Vec<u8>> {
        self.read_range(address, header, header.key_range())
    }

    /// Value bytes of the resident record at `address`.
    pub(crate) fn read_value(&self, address: Address, header: &RecordHeader) -> Option<Vec<u8>> {
        self.read_range(address, header, header.value_range())
    }

    /// Write a complete record into reserved space. The header word goes last.
    pub(crate) fn write_record(
        &self,
        address: Address,
        info: RecordInfo,
        key: &[u8],
        value: &[u8],
    ) -> Option<()> {
        let header = RecordHeader::new(info, key.len() as u32, value.len() as u32);
        let (frame, offset) = self.locate(address, header.record_size())?;
        frame
            .word(offset + 8)?
            .store(header.lengths_word(), Ordering::Relaxed);
        frame.write_bytes(offset + header.key_range().start, key)?;
        frame.write_bytes(offset + header.value_range().start, value)?;
        frame.word(offset)?.store(info.control(), Ordering::Release);
        Some(())
    }

    /// Overwrite the value of a resident record with bytes of the same length.
    pub(crate) fn write_value(
        &self,
        address: Address,
        header: &RecordHeader,
        value: &[u8],
    ) -> Option<()> {
        if value.len() != header.value_len as usize {
            return None;
        }
        let (frame, offset) = self.locate(address, header.record_size())?;
        frame.write_bytes(offset + header.value_range().start, value)
    }

    /// Take the lock bit of the resident record at `address`.
    pub(crate) fn lock_record(&self, address: Address) -> Option<RecordLock<'_>> {
        let word = self.info_word(address)?;
        loop {
            let current = word.load(Ordering::Acquire);
            if current & RecordInfo::LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if word
                .compare_exchange_weak(
                    current,
                    current | RecordInfo::LOCK_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(RecordLock { word });
            }
        }
    }

    /// Mark a record that lost its index insertion race.
    pub(crate) fn invalidate(&self, address: Address) {
        if let Some(word) = self.info_word(address) {
            word.fetch_or(RecordInfo::INVALID_BIT, Ordering::AcqRel);
        }
    }

    /// Current log statistics.
    pub fn stats(&self) -> LogStats {
        let tail = self.tail_address();
        let read_only = self.read_only_address();
        let head = self.head_address();
        let begin = self.begin_address();
        LogStats {
            begin_address: begin,
            head_address: head,
            safe_head_address: self.safe_head_address(),
            read_only_address: read_only,
            safe_read_only_address: self.safe_read_only_address(),
            flushed_until_address: self.flushed_until_address(),
            tail_address: tail,
            object_log_tail: self.object_log_tail(),
            mutable_bytes: tail.control().saturating_sub(read_only.control()),
            read_only_bytes: read_only.control().saturating_sub(head.control()),
            on_disk_bytes: head.control().saturating_sub(begin.control()),
            memory_pages: self.config.memory_pages,
            flush_failures: self.flush_failures(),
        }
    }
}

/// Exclusive hold on a record's lock bit; released on drop.
pub(crate) struct RecordLock<'a> {
    word: &'a AtomicU64,
}

impl RecordLock<'_> {
    /// Set or clear the tombstone bit.
    pub(crate) fn set_tombstone(&self, tombstone: bool) {
        if tombstone {
            self.word
                .fetch_or(RecordInfo::TOMBSTONE_BIT, Ordering::AcqRel);
        } else {
            self.word
                .fetch_and(!RecordInfo::TOMBSTONE_BIT, Ordering::AcqRel);
        }
    }
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        self.word.fetch_and(!RecordInfo::LOCK_BIT, Ordering::Release);
    }
}

/// Snapshot of the log boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    /// Begin address
    pub begin_address: Address,
    /// Head address
    pub head_address: Address,
    /// Safe head address
    pub safe_head_address: Address,
    /// Read-only boundary
    pub read_only_address: Address,
    /// Safe read-only boundary
    pub safe_read_only_address: Address,
    /// Flushed-until address
    pub flushed_until_address: Address,
    /// Tail address
    pub tail_address: Address,
    /// Object log end
    pub object_log_tail: u64,
    /// Bytes in the mutable region
    pub mutable_bytes: u64,
    /// Bytes resident but immutable
    pub read_only_bytes: u64,
    /// Live bytes only on the device
    pub on_disk_bytes: u64,
    /// Resident page frames
    pub memory_pages: u64,
    /// Failed flushes
    pub flush_failures: u64,
}

impl std::fmt::Display for LogStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Log Statistics:")?;
        writeln!(f, "  Begin: {}", self.begin_address)?;
        writeln!(f, "  Head: {} (safe {})", self.head_address, self.safe_head_address)?;
        writeln!(
            f,
            "  Read-only: {} (safe {})",
            self.read_only_address, self.safe_read_only_address
        )?;
        writeln!(f, "  Flushed until: {}", self.flushed_until_address)?;
        writeln!(f, "  Tail: {}", self.tail_address)?;
        writeln!(f, "  Mutable bytes: {}", self.mutable_bytes)?;
        writeln!(f, "  Read-only bytes: {}", self.read_only_bytes)?;
        writeln!(f, "  On-disk bytes: {}", self.on_disk_bytes)?;
        write!(f, "  Memory pages: {}", self.memory_pages)
    }
}

mod flush;
