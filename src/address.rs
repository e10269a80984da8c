//! Logical addresses into the hybrid log
//!
//! An address is a monotonically increasing 48-bit byte offset into the log.
//! Page and segment boundaries depend on the configured page/segment size and
//! are always computed with shifts and masks (see [`LogGeometry`]).

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// A logical address into the hybrid log.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// Invalid-address sentinel terminating every record chain.
    ///
    /// Set to 1, not 0, so that an all-zero hash bucket entry (unused) is distinguishable
    /// from an entry that points to an invalid address.
    pub const INVALID: Self = Self(1);

    /// Total number of address bits.
    pub const ADDRESS_BITS: u32 = 48;

    /// Maximum representable address.
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// First address handed out by a fresh log. Lower addresses are reserved for sentinels.
    pub const FIRST_VALID: Self = Self(64);

    /// Create an address from a raw control value.
    #[inline]
    pub const fn new(control: u64) -> Self {
        Self(control & Self::MAX_ADDRESS)
    }

    /// Create an address from a raw control value without masking.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Raw control value.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if this is the invalid sentinel.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Check if this is not the invalid sentinel.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Address(INVALID)")
        } else {
            write!(f, "Address({:#x})", self.0)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Page and segment arithmetic for a configured log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry {
    page_bits: u32,
    segment_bits: u32,
}

impl LogGeometry {
    /// Create a geometry; `segment_bits` must be at least `page_bits`.
    pub const fn new(page_bits: u32, segment_bits: u32) -> Self {
        Self {
            page_bits,
            segment_bits,
        }
    }

    /// Page size in bytes.
    #[inline]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Number of page bits.
    #[inline]
    pub const fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// Segment size in bytes.
    #[inline]
    pub const fn segment_size(&self) -> u64 {
        1 << self.segment_bits
    }

    /// Page that contains `address`.
    #[inline]
    pub const fn page(&self, address: Address) -> u64 {
        address.0 >> self.page_bits
    }

    /// Offset of `address` within its page.
    #[inline]
    pub const fn offset(&self, address: Address) -> u64 {
        address.0 & (self.page_size() - 1)
    }

    /// Segment that contains `address`.
    #[inline]
    pub const fn segment(&self, address: Address) -> u64 {
        address.0 >> self.segment_bits
    }

    /// First address of `page`.
    #[inline]
    pub const fn page_start(&self, page: u64) -> Address {
        Address(page << self.page_bits)
    }

    /// Round `address` down to its page boundary.
    #[inline]
    pub const fn align_down(&self, address: Address) -> Address {
        Address(address.0 & !(self.page_size() - 1))
    }
}

/// Atomic version of [`Address`].
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address atomically
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address atomically
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare and exchange the address atomically
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Raise the address to `target` if it is currently lower.
    ///
    /// Returns the previous value when this call moved it, `None` otherwise.
    pub fn fetch_max(&self, target: Address) -> Option<Address> {
        let previous = Address(self.control.fetch_max(target.0, AtomicOrdering::AcqRel));
        (previous < target).then_some(previous)
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.load(AtomicOrdering::Relaxed);
        f.debug_struct("AtomicAddress")
            .field("address", &addr)
            .finish()
    }
}

/// Packed tail position: page number in the high 32 bits, byte offset in the low 32 bits.
///
/// The offset may run past the end of the page while writers race for the next page;
/// [`TailOffset::to_address`] clamps it.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TailOffset(u64);

impl TailOffset {
    /// Create a packed tail position.
    #[inline]
    pub const fn new(page: u64, offset: u64) -> Self {
        Self((page << 32) | (offset & 0xFFFF_FFFF))
    }

    /// Page number.
    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> 32
    }

    /// Offset, possibly past the end of the page.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    /// Convert to a logical address, clamping the offset to the page size.
    #[inline]
    pub fn to_address(&self, geometry: &LogGeometry) -> Address {
        let offset = self.offset().min(geometry.page_size());
        Address(geometry.page_start(self.page()).0 + offset)
    }

    /// Pack a logical address.
    #[inline]
    pub fn from_address(address: Address, geometry: &LogGeometry) -> Self {
        Self::new(geometry.page(address), geometry.offset(address))
    }
}

impl fmt::Debug for TailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailOffset")
            .field("page", &self.page())
            .field("offset", &self.offset())
            .finish()
    }
}

/// Atomic tail position supporting fetch-add reservation and page turns.
#[repr(transparent)]
pub struct AtomicTailOffset {
    control: AtomicU64,
}

impl AtomicTailOffset {
    /// Create a new atomic tail.
    pub const fn new(tail: TailOffset) -> Self {
        Self {
            control: AtomicU64::new(tail.0),
        }
    }

    /// Load the tail.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> TailOffset {
        TailOffset(self.control.load(ordering))
    }

    /// Store the tail.
    #[inline]
    pub fn store(&self, tail: TailOffset, ordering: AtomicOrdering) {
        self.control.store(tail.0, ordering);
    }

    /// Reserve `size` bytes, returning the position before the reservation.
    #[inline]
    pub fn reserve(&self, size: u32) -> TailOffset {
        TailOffset(self.control.fetch_add(size as u64, AtomicOrdering::AcqRel))
    }

    /// Move the tail to the start of `page + 1` if it is still on `page`.
    ///
    /// Returns `(advanced, won)`: `advanced` is true when the tail is now past `page`,
    /// `won` is true when this call performed the move.
    pub fn new_page(&self, page: u64) -> (bool, bool) {
        let mut current = self.load(AtomicOrdering::Acquire);
        loop {
            if current.page() > page {
                return (true, false);
            }
            let next = TailOffset::new(page + 1, 0);
            match self.control.compare_exchange(
                current.0,
                next.0,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return (true, true),
                Err(actual) => current = TailOffset(actual),
            }
        }
    }
}
