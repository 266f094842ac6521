//! 28-bit wrapping byte counters used by flow control.
//!
//! Both ends of a link count bytes modulo 2^28 and only ever compare counts
//! by masked subtraction, so a long-lived session can wrap without either side
//! noticing.

use std::fmt;

pub const MASK: u32 = 0x0FFF_FFFF;
const HIGH_BIT: u32 = 1 << 27;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WrapCount(u32);

impl WrapCount {
    pub const ZERO: WrapCount = WrapCount(0);

    pub fn new(n: u32) -> Self {
        Self(n & MASK)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Bytes from `earlier` up to `self`.
    pub fn distance_from(self, earlier: WrapCount) -> u32 {
        self.0.wrapping_sub(earlier.0) & MASK
    }

    pub fn advance(self, n: usize) -> Self {
        Self(self.0.wrapping_add(n as u32) & MASK)
    }

    pub fn retreat(self, n: usize) -> Self {
        Self(self.0.wrapping_sub(n as u32) & MASK)
    }

    /// True when `self` lies behind `reference` in wrapping order, i.e. the
    /// forward distance from `reference` has its top bit set.
    pub fn is_behind(self, reference: WrapCount) -> bool {
        self.distance_from(reference) & HIGH_BIT != 0
    }

    pub fn parse(text: &str) -> Option<Self> {
        text.trim().parse::<u32>().ok().map(Self::new)
    }
}

impl fmt::Debug for WrapCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrapCount({})", self.0)
    }
}

impl fmt::Display for WrapCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
