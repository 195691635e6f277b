//! Frame-counter comparator
//!
//! Each channel exposes a 6-bit frame counter that wraps every 64 frames.
//! Counters are only ordered within one channel, and only as a circular
//! sequence: both values are shifted into the top of an `i8` so the
//! wrapping difference carries the sign, the same trick serial-number
//! arithmetic uses for TCP sequence numbers.

use core::fmt;
use static_assertions::const_assert;

/// Number of significant counter bits
pub const FRCNT_BITS: u32 = 6;

const FRCNT_MASK: u8 = (1 << FRCNT_BITS) - 1;
const FRCNT_SHIFT: u32 = 8 - FRCNT_BITS;

// The comparator needs at least one spare bit on top of the counter
const_assert!(FRCNT_BITS < 8);

/// A 6-bit hardware frame counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameCount(u8);

impl FrameCount {
    /// Wrap `raw` into the counter range
    pub const fn new(raw: u32) -> Self {
        Self((raw as u8) & FRCNT_MASK)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The value the counter takes after one more frame
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1) & FRCNT_MASK)
    }

    /// `self <= other` in circular order
    pub fn reached_by(self, other: FrameCount) -> bool {
        frcnt_lte(self, other)
    }
}

impl fmt::Display for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circular `a <= b` over 6-bit counters
///
/// Holds when `b` is `a` or up to half a cycle (31 frames) after it. At
/// exactly half a cycle the difference is -128 and still counts as reached.
pub fn frcnt_lte(a: FrameCount, b: FrameCount) -> bool {
    let a = a.0 << FRCNT_SHIFT;
    let b = b.0 << FRCNT_SHIFT;
    (a.wrapping_sub(b) as i8) <= 0
}
