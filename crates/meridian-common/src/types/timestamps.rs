//! Timestamp type for Meridian.
//!
//! Timestamps are the backbone of snapshot isolation: the oracle issues
//! them in strictly increasing order across the whole cluster, and every
//! visibility decision compares them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical cluster-wide timestamp.
///
/// Timestamps are strictly increasing over the lifetime of a logical
/// cluster and never reused. They are logical counters, not wall-clock
/// times: only their order matters.
///
/// `Timestamp::ZERO` is never issued by the oracle. It is reserved for the
/// single-version slot of CAS-managed cells and for the aborted-commit
/// sentinel in the commit table.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::Timestamp;
///
/// let ts = Timestamp::new(42);
/// assert_eq!(ts.as_u64(), 42);
/// assert!(ts > Timestamp::ZERO);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp. Never issued; reserved for sentinels.
    pub const ZERO: Self = Self(0);

    /// First timestamp the oracle may issue.
    pub const MIN_ISSUED: Self = Self(1);

    /// Maximum timestamp value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new `Timestamp` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next timestamp.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous timestamp, saturating at zero.
    ///
    /// Used when walking cell versions downward: the next query's upper
    /// bound is one below the version just examined.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Checks whether this is the reserved zero timestamp.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Creates a `Timestamp` from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Converts to bytes (big-endian).
    ///
    /// Big-endian so that byte order equals numeric order, which keeps
    /// commit-table rows sorted by start timestamp.
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Self::new(ts)
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Timestamp::new(1) < Timestamp::new(2));
        assert!(Timestamp::ZERO < Timestamp::MIN_ISSUED);
        assert!(Timestamp::new(u64::MAX - 1) < Timestamp::MAX);
    }

    #[test]
    fn test_next_prev() {
        let ts = Timestamp::new(10);
        assert_eq!(ts.next().as_u64(), 11);
        assert_eq!(ts.prev().as_u64(), 9);

        // Saturation at the edges
        assert_eq!(Timestamp::ZERO.prev(), Timestamp::ZERO);
        assert_eq!(Timestamp::MAX.next(), Timestamp::MAX);
    }

    #[test]
    fn test_byte_round_trip() {
        let ts = Timestamp::new(0x0102_0304_0506_0708);
        let bytes = ts.to_be_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(Timestamp::from_be_bytes(bytes), ts);
    }

    #[test]
    fn test_byte_order_matches_numeric_order() {
        let small = Timestamp::new(5).to_be_bytes();
        let large = Timestamp::new(300).to_be_bytes();
        assert!(small < large);
    }
}
