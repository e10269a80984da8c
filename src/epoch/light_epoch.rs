//! LightEpoch - lightweight epoch-based memory reclamation
//!
//! Workers register explicitly and receive an [`EpochContext`] that names their
//! slot in the shared epoch table. There is no thread-local state: whoever holds
//! the context passes it to the index and log operations that need protection.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

/// Special epoch value indicating the worker is not protected
pub const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions
const DRAIN_LIST_SIZE: usize = 256;

/// Entry in the epoch table (one per registered worker)
#[repr(C, align(64))]
struct Entry {
    /// Local epoch value seen by this worker
    local_current_epoch: AtomicU64,
    /// Whether a live `EpochContext` owns this slot
    in_use: AtomicBool,
    _padding: [u8; CACHE_LINE_BYTES - 9],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            in_use: AtomicBool::new(false),
            _padding: [0; CACHE_LINE_BYTES - 9],
        }
    }
}

/// Action to be performed when an epoch becomes safe to reclaim
struct EpochAction {
    /// The epoch that must be safe before the callback runs
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    /// Epoch value indicating this slot is free
    const FREE: u64 = u64::MAX;
    /// Epoch value indicating this slot is locked
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Take and run the callback if the slot still carries `expected_epoch`.
    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state grants exclusive access to `callback`.
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Install a callback into a free slot.
    ///
    /// Returns the callback back when the slot was taken concurrently.
    fn try_push<F>(&self, prior_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state grants exclusive access to `callback`.
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }

    /// Replace an already-safe action with a new one, running the old callback.
    fn try_swap<F>(&self, expected_epoch: u64, prior_epoch: u64, new_callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state grants exclusive access to `callback`.
                let existing = unsafe { (*self.callback.get()).take() };
                unsafe {
                    *self.callback.get() = Some(Box::new(new_callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                if let Some(cb) = existing {
                    cb();
                }
                Ok(())
            }
            Err(_) => Err(new_callback),
        }
    }
}

// SAFETY: the callback cell is only touched while the slot is in the LOCKED state.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Shared epoch table plus the deferred-action drain list.
pub struct LightEpoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    /// Number of pending drain actions
    drain_count: AtomicU32,
    /// Current global epoch
    current_epoch: AtomicU64,
    /// Cached safe-to-reclaim epoch
    safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create an epoch table with room for [`MAX_THREADS`] workers.
    pub fn new() -> Self {
        Self::with_capacity(MAX_THREADS)
    }

    /// Create an epoch table with room for `max_workers` workers.
    pub fn with_capacity(max_workers: usize) -> Self {
        let table: Vec<Entry> = (0..max_workers.max(1)).map(|_| Entry::new()).collect();
        let drain_list: Vec<EpochAction> =
            (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect();

        Self {
            table: table.into_boxed_slice(),
            drain_list: drain_list.into_boxed_slice(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Register a worker, returning its explicit epoch context.
    ///
    /// Returns `None` when every slot is taken.
    pub fn register(self: &Arc<Self>) -> Option<EpochContext> {
        for (slot, entry) in self.table.iter().enumerate() {
            if entry
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry
                    .local_current_epoch
                    .store(UNPROTECTED, Ordering::Release);
                return Some(EpochContext {
                    epoch: Arc::clone(self),
                    slot,
                });
            }
        }
        None
    }

    /// Register a worker, spinning until a slot frees up.
    pub fn register_blocking(self: &Arc<Self>) -> EpochContext {
        loop {
            if let Some(ctx) = self.register() {
                return ctx;
            }
            thread::yield_now();
        }
    }

    /// Number of worker slots.
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Number of registered workers.
    pub fn registered(&self) -> usize {
        self.table
            .iter()
            .filter(|e| e.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Current global epoch.
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Last computed safe-to-reclaim epoch.
    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Number of deferred actions still waiting.
    pub fn pending_actions(&self) -> u32 {
        self.drain_count.load(Ordering::Acquire)
    }

    fn release(&self, slot: usize) {
        let entry = &self.table[slot];
        entry
            .local_current_epoch
            .store(UNPROTECTED, Ordering::SeqCst);
        entry.in_use.store(false, Ordering::Release);
    }

    // SeqCst: paired with maintenance-phase flags checked right after protecting.
    #[inline]
    fn protect(&self, slot: usize) -> u64 {
        let epoch = self.current_epoch.load(Ordering::SeqCst);
        self.table[slot]
            .local_current_epoch
            .store(epoch, Ordering::SeqCst);
        epoch
    }

    #[inline]
    fn protect_and_drain(&self, slot: usize) -> u64 {
        let epoch = self.protect(slot);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    #[inline]
    fn is_protected(&self, slot: usize) -> bool {
        self.table[slot].local_current_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    #[inline]
    fn unprotect(&self, slot: usize) {
        self.table[slot]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::SeqCst);
    }

    /// Run pending actions whose trigger epoch is now safe.
    pub fn drain(&self, next_epoch: u64) {
        let safe_epoch = self.compute_new_safe_to_reclaim_epoch(next_epoch);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch <= safe_epoch
                && trigger_epoch != EpochAction::FREE
                && trigger_epoch != EpochAction::LOCKED
                && action.try_pop(trigger_epoch)
                && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Increment the current epoch
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and defer `callback` until every worker has left the prior epoch.
    ///
    /// Returns the new current epoch.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback = callback;
        let mut i = 0;
        let mut sweeps = 0u32;
        loop {
            let trigger_epoch = self.drain_list[i].epoch.load(Ordering::Acquire);

            if trigger_epoch == EpochAction::FREE {
                match self.drain_list[i].try_push(prior_epoch, callback) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return prior_epoch + 1;
                    }
                    Err(returned) => callback = returned,
                }
            } else if trigger_epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire) {
                match self.drain_list[i].try_swap(trigger_epoch, prior_epoch, callback) {
                    Ok(()) => return prior_epoch + 1,
                    Err(returned) => callback = returned,
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                sweeps += 1;
                if sweeps == 500 && tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(prior_epoch, "epoch drain list is full; waiting for a free slot");
                }
                self.drain(self.current_epoch());
                thread::yield_now();
            }
        }
    }

    /// Compute the new safe-to-reclaim epoch by scanning all workers.
    ///
    /// The result never exceeds the oldest protected local epoch minus one.
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;

        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::SeqCst);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Spin until `target_safe_epoch` is safe to reclaim.
    pub fn spin_wait_for_safe_to_reclaim(&self, target_safe_epoch: u64) {
        loop {
            let safe = self.compute_new_safe_to_reclaim_epoch(self.current_epoch());
            if safe >= target_safe_epoch {
                break;
            }
            thread::yield_now();
        }
    }

    /// Check if an epoch is safe to reclaim
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's registration in the epoch table.
///
/// Dropping the context unprotects and frees the slot.
pub struct EpochContext {
    epoch: Arc<LightEpoch>,
    slot: usize,
}

impl EpochContext {
    /// Slot index in the epoch table.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Shared epoch table.
    #[inline]
    pub fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    /// Mark this worker as active at the current epoch.
    #[inline]
    pub fn protect(&self) -> u64 {
        self.epoch.protect(self.slot)
    }

    /// Protect and run any deferred actions that became safe.
    #[inline]
    pub fn protect_and_drain(&self) -> u64 {
        self.epoch.protect_and_drain(self.slot)
    }

    /// Leave the protected region.
    #[inline]
    pub fn unprotect(&self) {
        self.epoch.unprotect(self.slot)
    }

    /// Whether this worker is currently protected.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.epoch.is_protected(self.slot)
    }

    /// Advance this worker's epoch (only if already protected) and drain.
    #[inline]
    pub fn refresh(&self) {
        if self.is_protected() {
            self.protect_and_drain();
        }
    }

    /// RAII protection scope.
    pub fn guard(&self) -> EpochGuard<'_> {
        self.protect_and_drain();
        EpochGuard { ctx: self }
    }
}

impl Drop for EpochContext {
    fn drop(&mut self) {
        self.epoch.release(self.slot);
    }
}

impl std::fmt::Debug for EpochContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochContext")
            .field("slot", &self.slot)
            .field("protected", &self.is_protected())
            .finish()
    }
}

/// RAII guard for epoch protection
pub struct EpochGuard<'a> {
    ctx: &'a EpochContext,
}

impl EpochGuard<'_> {
    /// Context this guard protects.
    pub fn context(&self) -> &EpochContext {
        self.ctx
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.ctx.unprotect();
    }
}
