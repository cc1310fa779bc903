use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::output;

/// Number of in-flight release slots in [`GuardMode::PerAddress`] mode.
pub const GUARD_SLOTS: usize = 64;

const EMPTY: usize = 0;
const SPINS_BEFORE_YIELD: u32 = 64;

/// How the release path excludes concurrent work on the same block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GuardMode {
    /// Releases of distinct addresses proceed concurrently; a second release
    /// of an address that is already being released is dropped.
    #[default]
    PerAddress,
    /// One process-wide marker. While any release is in flight every other
    /// release is dropped and its memory leaked. Each drop is counted and
    /// warned about.
    SingleSlot,
}

impl GuardMode {
    const fn to_u8(self) -> u8 {
        match self {
            GuardMode::PerAddress => 0,
            GuardMode::SingleSlot => 1,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => GuardMode::SingleSlot,
            _ => GuardMode::PerAddress,
        }
    }
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardMode::PerAddress => f.write_str("per-address"),
            GuardMode::SingleSlot => f.write_str("single-slot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseGuardModeError(String);

impl fmt::Display for ParseGuardModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown guard mode `{}` (expected `per-address` or `single-slot`)",
            self.0
        )
    }
}

impl std::error::Error for ParseGuardModeError {}

impl FromStr for GuardMode {
    type Err = ParseGuardModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-address" | "per_address" | "address" => Ok(GuardMode::PerAddress),
            "single-slot" | "single_slot" | "single" | "legacy" => Ok(GuardMode::SingleSlot),
            _ => Err(ParseGuardModeError(s.to_string())),
        }
    }
}

/// Admission control for the release path.
///
/// The idle state is an empty slot; entering stores the address being
/// released and the returned [`GuardTicket`] clears it again.
pub struct ReentrancyGuard {
    mode: AtomicU8,
    slots: [AtomicUsize; GUARD_SLOTS],
    dropped: AtomicUsize,
}

static GLOBAL_GUARD: ReentrancyGuard = ReentrancyGuard::new();

/// The guard used alongside [`registry()`](crate::registry).
#[inline]
pub const fn guard() -> &'static ReentrancyGuard {
    &GLOBAL_GUARD
}

impl Default for ReentrancyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "the guard stays busy until the ticket is dropped"]
pub struct GuardTicket<'a> {
    slot: &'a AtomicUsize,
}

impl Drop for GuardTicket<'_> {
    #[inline]
    fn drop(&mut self) {
        self.slot.store(EMPTY, Ordering::Release);
    }
}

impl ReentrancyGuard {
    pub const fn new() -> Self {
        Self::with_mode(GuardMode::PerAddress)
    }

    pub const fn with_mode(mode: GuardMode) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_u8()),
            slots: [const { AtomicUsize::new(EMPTY) }; GUARD_SLOTS],
            dropped: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn mode(&self) -> GuardMode {
        GuardMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: GuardMode) {
        self.mode.store(mode.to_u8(), Ordering::Relaxed);
    }

    /// Releases that were denied entry and therefore never freed.
    pub fn dropped_releases(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Asks to release `address`. `None` means the release must be dropped.
    ///
    /// Null is never admitted; callers treat it as a no-op before asking.
    pub fn enter(&self, address: usize) -> Option<GuardTicket<'_>> {
        debug_assert_ne!(address, EMPTY);

        let ticket = match self.mode() {
            GuardMode::PerAddress => self.enter_per_address(address),
            GuardMode::SingleSlot => self.enter_single_slot(address),
        };

        if ticket.is_none() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ticket
    }

    fn enter_single_slot(&self, address: usize) -> Option<GuardTicket<'_>> {
        let slot = &self.slots[0];
        match slot.compare_exchange(EMPTY, address, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Some(GuardTicket { slot }),
            Err(busy) => {
                output::warn(format_args!(
                    "release of {:#x} dropped: single-slot guard busy with {:#x} (memory leaked)",
                    address, busy
                ));
                None
            }
        }
    }

    fn enter_per_address(&self, address: usize) -> Option<GuardTicket<'_>> {
        let slot = &self.slots[slot_index(address)];
        let mut spins = 0u32;
        loop {
            match slot.compare_exchange_weak(EMPTY, address, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Some(GuardTicket { slot }),
                Err(busy) if busy == address => {
                    output::warn(format_args!(
                        "release of {:#x} dropped: the same address is already being released",
                        address
                    ));
                    return None;
                }
                Err(_) => {
                    // Another address hashed to this slot; wait for it.
                    spins += 1;
                    if spins < SPINS_BEFORE_YIELD {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

#[inline]
fn slot_index(address: usize) -> usize {
    // Blocks are at least 8-byte aligned, so the low bits carry nothing.
    let mixed = ((address >> 3) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 32) as usize % GUARD_SLOTS
}
