//! Hybrid timestamps and the per-tablet hybrid clock.
//!
//! A hybrid time packs wall-clock microseconds with a small logical
//! component so that timestamps assigned within the same microsecond still
//! order totally. Each tablet owns one [`HybridClock`]; every value it hands
//! out is strictly greater than the previous one, which is what gives the
//! tablet its monotonic commit timeline.
//!
//! # Thread safety
//!
//! The clock keeps its last-issued value under a `parking_lot::Mutex`. The
//! lock is held only for the compare-and-advance step.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical component.
const LOGICAL_BITS: u32 = 12;

/// Mask for extracting the logical component.
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical/physical timestamp.
///
/// Bit layout: `| 52 bits: physical microseconds | 12 bits: logical |`.
///
/// # Display
///
/// Formats as `{ physical: <micros> logical: <n> }`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HybridTime(u64);

impl HybridTime {
    /// The lowest possible hybrid time.
    pub const MIN: HybridTime = HybridTime(0);

    /// Creates a hybrid time from physical microseconds and a logical
    /// component.
    #[inline]
    pub const fn new(physical_micros: u64, logical: u64) -> Self {
        Self((physical_micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Creates a hybrid time from physical microseconds with a zero logical
    /// component.
    #[inline]
    pub const fn from_micros(physical_micros: u64) -> Self {
        Self::new(physical_micros, 0)
    }

    /// Returns the physical component in microseconds.
    #[inline]
    pub const fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Returns the logical component.
    #[inline]
    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Returns the raw 64-bit representation.
    #[inline]
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Reconstructs a hybrid time from its raw 64-bit representation.
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ physical: {} logical: {} }}", self.physical_micros(), self.logical())
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Saturates to zero if the system clock is before the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Monotonic hybrid-time source for a single tablet.
///
/// Each call to [`HybridClock::now`] returns either the current physical
/// time or, when the wall clock has not advanced past the last issued value,
/// the last value plus one logical tick. The result is strictly increasing
/// across all callers.
#[derive(Debug)]
pub struct HybridClock {
    /// Raw value of the last hybrid time handed out.
    last: Mutex<u64>,
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridClock {
    /// Creates a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    /// Returns the next hybrid time, strictly greater than any previously
    /// returned value.
    pub fn now(&self) -> HybridTime {
        let physical = now_micros() << LOGICAL_BITS;
        let mut last = self.last.lock();
        if physical > *last {
            *last = physical;
        } else {
            *last += 1;
        }
        HybridTime(*last)
    }

    /// Returns the last hybrid time issued, without advancing the clock.
    pub fn last(&self) -> HybridTime {
        HybridTime(*self.last.lock())
    }
}
