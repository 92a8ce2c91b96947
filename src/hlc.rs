//! Hybrid-Logical Clock
//!
//! All mutation and checkpoint ordering in stagehand uses an HLC: a
//! wall-clock nanosecond count paired with a logical counter that breaks
//! ties between events in the same nanosecond.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A hybrid-logical clock reading.
///
/// Ordering is lexicographic on `(nanos, logical)`, which the derived
/// `Ord` provides because of field declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hlc {
    nanos: i64,
    logical: i32,
}

impl Hlc {
    /// The zero sentinel, ordered before every real clock reading.
    pub const ZERO: Hlc = Hlc { nanos: 0, logical: 0 };

    /// Create a clock reading from its components.
    pub fn new(nanos: i64, logical: i32) -> Self {
        Self { nanos, logical }
    }

    /// Wall-clock component in nanoseconds.
    pub fn nanos(&self) -> i64 {
        self.nanos
    }

    /// Logical tie-break component.
    pub fn logical(&self) -> i32 {
        self.logical
    }

    /// True for the zero sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The clock reading shifted back by a wall-clock duration.
    ///
    /// The logical component is preserved. Saturates at the zero sentinel
    /// rather than going negative.
    pub fn before_offset(&self, offset: Duration) -> Self {
        let nanos = self.nanos.saturating_sub(offset.as_nanos() as i64);
        if nanos <= 0 {
            Self::ZERO
        } else {
            Self::new(nanos, self.logical)
        }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:010}", self.nanos, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Hlc::new(1, 0) > Hlc::ZERO);
        assert!(Hlc::new(1, 1) > Hlc::new(1, 0));
        assert!(Hlc::new(2, 0) > Hlc::new(1, 99));
        assert_eq!(Hlc::new(5, 5), Hlc::new(5, 5));
    }

    #[test]
    fn test_zero() {
        assert!(Hlc::ZERO.is_zero());
        assert!(Hlc::default().is_zero());
        assert!(!Hlc::new(0, 1).is_zero());
    }

    #[test]
    fn test_display() {
        assert_eq!(Hlc::new(1234, 5).to_string(), "1234.0000000005");
        assert_eq!(Hlc::ZERO.to_string(), "0.0000000000");
    }

    #[test]
    fn test_before_offset() {
        let ts = Hlc::new(100_000_000_000, 7);
        let shifted = ts.before_offset(Duration::from_secs(5));
        assert_eq!(shifted, Hlc::new(95_000_000_000, 7));

        // Shifting past the epoch saturates to zero.
        assert_eq!(Hlc::new(10, 3).before_offset(Duration::from_secs(1)), Hlc::ZERO);
    }
}
