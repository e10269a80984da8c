//! System state shared by workers and maintenance tasks.
//!
//! One maintenance action (checkpoint, index growth) runs at a time. While its
//! phase is [`Phase::Paused`], workers do not enter operations; the action
//! waits for an epoch action to prove that nobody is inside one, does its
//! quiesced work, and resumes the store.

use std::sync::atomic::{AtomicU64, Ordering};

/// Maintenance action in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// No action in progress
    #[default]
    None = 0,
    /// Index and log checkpoint
    Checkpoint = 1,
    /// Index doubling
    GrowIndex = 2,
    /// Log compaction
    Compact = 3,
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::Checkpoint,
            2 => Action::GrowIndex,
            3 => Action::Compact,
            _ => Action::None,
        }
    }
}

/// Phase of the current action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// Operations run normally
    #[default]
    Rest = 0,
    /// Operations wait outside epoch protection
    Paused = 1,
    /// Operations run; the action finishes its I/O in the background
    Persisting = 2,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            1 => Phase::Paused,
            2 => Phase::Persisting,
            _ => Phase::Rest,
        }
    }
}

/// Action, phase and store version packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// Action being performed
    pub action: Action,
    /// Current phase of the action
    pub phase: Phase,
    /// Store version; records remember the version that wrote them
    pub version: u32,
}

impl SystemState {
    /// Create a new system state
    pub const fn new(action: Action, phase: Phase, version: u32) -> Self {
        Self {
            action,
            phase,
            version,
        }
    }

    /// Create a rest state
    pub const fn rest(version: u32) -> Self {
        Self::new(Action::None, Phase::Rest, version)
    }

    /// Pack into u64 for atomic operations
    #[inline]
    pub fn to_control(&self) -> u64 {
        (self.action as u64) | ((self.phase as u64) << 8) | ((self.version as u64) << 16)
    }

    /// Unpack from u64
    #[inline]
    pub fn from_control(control: u64) -> Self {
        Self {
            action: Action::from((control & 0xFF) as u8),
            phase: Phase::from(((control >> 8) & 0xFF) as u8),
            version: ((control >> 16) & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Atomic [`SystemState`].
#[derive(Debug)]
pub struct AtomicSystemState {
    control: AtomicU64,
}

impl AtomicSystemState {
    /// Start at rest with `version`.
    pub fn new(version: u32) -> Self {
        Self {
            control: AtomicU64::new(SystemState::rest(version).to_control()),
        }
    }

    /// Current state.
    ///
    /// SeqCst pairs with the epoch protect that precedes it on the worker side.
    #[inline]
    pub fn load(&self) -> SystemState {
        SystemState::from_control(self.control.load(Ordering::SeqCst))
    }

    /// Current store version.
    #[inline]
    pub fn version(&self) -> u32 {
        self.load().version
    }

    /// Whether workers must stay out of operations.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.load().phase == Phase::Paused
    }

    /// Claim the state for `action` if no other action runs.
    pub fn try_start(&self, action: Action) -> Result<SystemState, SystemState> {
        let current = self.load();
        if current.action != Action::None {
            return Err(current);
        }
        let next = SystemState::new(action, Phase::Rest, current.version);
        self.control
            .compare_exchange(
                current.to_control(),
                next.to_control(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(SystemState::from_control)
            .map_err(SystemState::from_control)
    }

    /// Move the running action to `phase`.
    pub fn set_phase(&self, phase: Phase) {
        let current = self.load();
        self.store(SystemState::new(current.action, phase, current.version));
    }

    /// Advance the version by one and return the version that was closed.
    pub fn bump_version(&self) -> u32 {
        let current = self.load();
        self.store(SystemState::new(
            current.action,
            current.phase,
            current.version.wrapping_add(1),
        ));
        current.version
    }

    /// Overwrite the version (recovery).
    pub fn set_version(&self, version: u32) {
        let current = self.load();
        self.store(SystemState::new(current.action, current.phase, version));
    }

    /// End the running action.
    pub fn finish(&self) {
        let current = self.load();
        self.store(SystemState::rest(current.version));
    }

    // Only the thread that won `try_start` writes while an action runs.
    fn store(&self, state: SystemState) {
        self.control.store(state.to_control(), Ordering::SeqCst);
    }
}
