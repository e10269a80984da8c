//! Small helpers shared across the crate.

use parking_lot::{Condvar, Mutex};

/// Check if a value is a power of two
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Round up to the next power of two
#[inline]
pub const fn next_power_of_two(mut n: u64) -> u64 {
    if n == 0 {
        return 1;
    }
    n -= 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n |= n >> 32;
    n + 1
}

/// Pad a 64-bit size to the specified alignment
#[inline]
pub const fn pad_alignment_u64(size: u64, alignment: u64) -> u64 {
    debug_assert!(is_power_of_two(alignment));
    (size + alignment - 1) & !(alignment - 1)
}

/// Blocking countdown latch.
///
/// Used where a fixed number of asynchronous completions must land before the
/// caller proceeds (e.g. chunked index recovery).
#[derive(Debug)]
pub struct Countdown {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Countdown {
    /// Create a latch expecting `count` signals.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Record one completion. Returns true for the final one.
    pub fn signal(&self) -> bool {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.zero.notify_all();
            true
        } else {
            false
        }
    }

    /// Number of outstanding completions.
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }

    /// Block until every completion has been signalled.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.zero.wait(&mut remaining);
        }
    }
}
