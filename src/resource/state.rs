//! Lifecycle state of a resource.
//!
//! The state and the suspend-cycle counter share one `AtomicU64` so that every
//! transition is a single compare-and-set:
//!
//! ```text
//!  63                              8 7        0
//! ┌─────────────────────────────────┬──────────┐
//! │          suspend cycle          │  state   │
//! └─────────────────────────────────┴──────────┘
//! ```
//!
//! A timer armed for cycle N can only move the word from `(Suspended, N)`, so a
//! late expiry never touches a later cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const STATE_MASK: u64 = 0xff;
const CYCLE_SHIFT: u32 = 8;

/// Lifecycle state of a [`Resource`](crate::Resource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceState {
    /// Constructed, never suspended.
    Created = 0,
    /// Parked, waiting for a broadcast, a disconnect or its timer.
    Suspended = 1,
    /// Resumed with data; may be suspended again.
    Resumed = 2,
    /// The remote end disconnected.
    Cancelled = 3,
    /// The expiry timer fired while suspended.
    TimedOut = 4,
    /// Recycled; absorbs every further operation.
    Destroyed = 5,
}

impl ResourceState {
    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => ResourceState::Created,
            1 => ResourceState::Suspended,
            2 => ResourceState::Resumed,
            3 => ResourceState::Cancelled,
            4 => ResourceState::TimedOut,
            _ => ResourceState::Destroyed,
        }
    }

    /// Cancelled, TimedOut and Destroyed admit no transition except destroy.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceState::Cancelled | ResourceState::TimedOut | ResourceState::Destroyed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Created => "created",
            ResourceState::Suspended => "suspended",
            ResourceState::Resumed => "resumed",
            ResourceState::Cancelled => "cancelled",
            ResourceState::TimedOut => "timed out",
            ResourceState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub state: ResourceState,
    pub cycle: u64,
}

fn pack(state: ResourceState, cycle: u64) -> u64 {
    (cycle << CYCLE_SHIFT) | state as u64
}

fn unpack(word: u64) -> Snapshot {
    Snapshot {
        state: ResourceState::from_bits(word),
        cycle: word >> CYCLE_SHIFT,
    }
}

/// Atomic state word shared by all threads touching one resource.
#[derive(Debug)]
pub(crate) struct StateCell {
    word: AtomicU64,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(ResourceState::Created, 0)),
        }
    }

    pub fn load(&self) -> Snapshot {
        unpack(self.word.load(Ordering::SeqCst))
    }

    /// Move to `to` if the current state satisfies `allowed`.
    ///
    /// Returns the snapshot that was replaced, or the snapshot that was
    /// observed when `allowed` rejected it.
    pub fn transition(
        &self,
        to: ResourceState,
        allowed: impl Fn(ResourceState) -> bool,
    ) -> Result<Snapshot, Snapshot> {
        loop {
            let current = self.word.load(Ordering::SeqCst);
            let seen = unpack(current);
            if !allowed(seen.state) {
                return Err(seen);
            }
            if self
                .word
                .compare_exchange(
                    current,
                    pack(to, seen.cycle),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(seen);
            }
            // CAS failed, retry
        }
    }

    /// Enter `Suspended`, starting a new cycle.
    ///
    /// Returns the new cycle number.
    pub fn suspend(&self) -> Result<u64, Snapshot> {
        loop {
            let current = self.word.load(Ordering::SeqCst);
            let seen = unpack(current);
            if !matches!(seen.state, ResourceState::Created | ResourceState::Resumed) {
                return Err(seen);
            }
            let cycle = seen.cycle.wrapping_add(1);
            if self
                .word
                .compare_exchange(
                    current,
                    pack(ResourceState::Suspended, cycle),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(cycle);
            }
        }
    }

    /// Leave `Suspended` for `to`, but only within `cycle`.
    pub fn transition_in_cycle(&self, cycle: u64, to: ResourceState) -> bool {
        self.word
            .compare_exchange(
                pack(ResourceState::Suspended, cycle),
                pack(to, cycle),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
