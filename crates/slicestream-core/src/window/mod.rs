//! # Window Definitions
//!
//! Window shapes and the slice time ranges they decompose into.
//!
//! ## Window Types
//!
//! - **Tumbling**: fixed-size, non-overlapping windows
//! - **Sliding**: fixed-size windows advancing by a slide smaller than the size
//! - **Session**: dynamic windows separated by inactivity gaps
//!
//! A [`WindowDefinition`] is validated at construction of the operator; an
//! invalid combination (zero size, slide larger than size) is a typed
//! [`WindowError`], never a panic.

mod assigner;

pub use assigner::{SliceAssigner, SliceRangeVec};

use crate::time::TimeCharacteristic;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The shape of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    /// Fixed-size, non-overlapping windows. Tumbling is the degenerate
    /// sliding window with `slide == size`.
    Tumbling {
        /// Window size in milliseconds
        size_ms: i64,
    },
    /// Fixed-size windows starting at every multiple of `slide_ms`.
    Sliding {
        /// Window size in milliseconds
        size_ms: i64,
        /// Slide interval in milliseconds, `slide_ms <= size_ms`
        slide_ms: i64,
    },
    /// Activity-gap windows; provisional ranges are merged by the store
    /// when they overlap.
    Session {
        /// Inactivity gap in milliseconds
        gap_ms: i64,
    },
}

/// Errors for invalid window definitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    /// Window size must be positive.
    #[error("window size must be positive, got {0}ms")]
    ZeroSize(i64),

    /// Slide must be positive and no larger than the window size.
    #[error("slide must be positive and <= size (slide={slide}ms, size={size}ms)")]
    InvalidSlide {
        /// Configured slide in milliseconds
        slide: i64,
        /// Configured size in milliseconds
        size: i64,
    },

    /// Session gap must be positive.
    #[error("session gap must be positive, got {0}ms")]
    ZeroGap(i64),

    /// Duration did not fit in millisecond `i64`.
    #[error("duration out of range: {0:?}")]
    DurationOutOfRange(Duration),
}

fn duration_ms(d: Duration) -> Result<i64, WindowError> {
    i64::try_from(d.as_millis()).map_err(|_| WindowError::DurationOutOfRange(d))
}

/// A complete window definition for one operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDefinition {
    /// The window shape.
    pub kind: WindowKind,
    /// Event-time or processing-time semantics.
    pub time_characteristic: TimeCharacteristic,
    /// Grace period after the watermark during which late records are
    /// still merged, in milliseconds.
    pub allowed_lateness_ms: i64,
}

impl WindowDefinition {
    /// Creates a tumbling window definition.
    ///
    /// # Panics
    ///
    /// Panics if the size does not fit in `i64` milliseconds; use
    /// [`WindowDefinition::validate`] for fallible checking of the values.
    #[must_use]
    pub fn tumbling(size: Duration) -> Self {
        Self {
            kind: WindowKind::Tumbling {
                size_ms: duration_ms(size).expect("window size must fit in i64"),
            },
            time_characteristic: TimeCharacteristic::default(),
            allowed_lateness_ms: 0,
        }
    }

    /// Creates a sliding window definition.
    ///
    /// # Panics
    ///
    /// Panics if size or slide does not fit in `i64` milliseconds.
    #[must_use]
    pub fn sliding(size: Duration, slide: Duration) -> Self {
        Self {
            kind: WindowKind::Sliding {
                size_ms: duration_ms(size).expect("window size must fit in i64"),
                slide_ms: duration_ms(slide).expect("slide must fit in i64"),
            },
            time_characteristic: TimeCharacteristic::default(),
            allowed_lateness_ms: 0,
        }
    }

    /// Creates a session window definition.
    ///
    /// # Panics
    ///
    /// Panics if the gap does not fit in `i64` milliseconds.
    #[must_use]
    pub fn session(gap: Duration) -> Self {
        Self {
            kind: WindowKind::Session {
                gap_ms: duration_ms(gap).expect("gap must fit in i64"),
            },
            time_characteristic: TimeCharacteristic::default(),
            allowed_lateness_ms: 0,
        }
    }

    /// Sets the allowed lateness.
    ///
    /// # Panics
    ///
    /// Panics if the lateness does not fit in `i64` milliseconds.
    #[must_use]
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness_ms = duration_ms(lateness).expect("lateness must fit in i64");
        self
    }

    /// Sets the time characteristic.
    #[must_use]
    pub fn with_time_characteristic(mut self, tc: TimeCharacteristic) -> Self {
        self.time_characteristic = tc;
        self
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns a [`WindowError`] for zero sizes, zero gaps, or a slide
    /// larger than the size.
    pub fn validate(&self) -> Result<(), WindowError> {
        match self.kind {
            WindowKind::Tumbling { size_ms } => {
                if size_ms <= 0 {
                    return Err(WindowError::ZeroSize(size_ms));
                }
            }
            WindowKind::Sliding { size_ms, slide_ms } => {
                if size_ms <= 0 {
                    return Err(WindowError::ZeroSize(size_ms));
                }
                if slide_ms <= 0 || slide_ms > size_ms {
                    return Err(WindowError::InvalidSlide {
                        slide: slide_ms,
                        size: size_ms,
                    });
                }
            }
            WindowKind::Session { gap_ms } => {
                if gap_ms <= 0 {
                    return Err(WindowError::ZeroGap(gap_ms));
                }
            }
        }
        Ok(())
    }

    /// Returns true for session windows, which require merge-on-overlap.
    #[must_use]
    pub fn is_session(&self) -> bool {
        matches!(self.kind, WindowKind::Session { .. })
    }
}

/// A bounded, half-open time range `[start, end)` holding partial-aggregate
/// state for one slice.
///
/// Ranges order by start then end, which gives the store its start-ordered
/// slice log.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
pub struct SliceRange {
    /// Range start (inclusive, milliseconds)
    pub start: i64,
    /// Range end (exclusive, milliseconds)
    pub end: i64,
}

impl SliceRange {
    /// Creates a new range.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Returns the range duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Returns true if the timestamp falls inside `[start, end)`.
    ///
    /// A timestamp exactly on a boundary belongs to the range starting at
    /// that boundary, never to the one ending there.
    #[inline]
    #[must_use]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Returns true if the two ranges overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the union of two (typically overlapping) ranges.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Converts the range to a stack-allocated 16-byte key.
    ///
    /// Big-endian encoding preserves the start-major sort order.
    #[inline]
    #[must_use]
    pub fn to_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.start.to_be_bytes());
        key[8..16].copy_from_slice(&self.end.to_be_bytes());
        key
    }

    /// Parses a range from a byte key.
    ///
    /// Returns `None` if the key is not exactly 16 bytes.
    #[must_use]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 16 {
            return None;
        }
        let start = i64::from_be_bytes(key[0..8].try_into().ok()?);
        let end = i64::from_be_bytes(key[8..16].try_into().ok()?);
        Some(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_valid() {
        let def = WindowDefinition::tumbling(Duration::from_millis(1000));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_zero_size_rejected() {
        let def = WindowDefinition {
            kind: WindowKind::Tumbling { size_ms: 0 },
            time_characteristic: TimeCharacteristic::EventTime,
            allowed_lateness_ms: 0,
        };
        assert_eq!(def.validate(), Err(WindowError::ZeroSize(0)));
    }

    #[test]
    fn test_slide_larger_than_size_rejected() {
        let def = WindowDefinition::sliding(Duration::from_millis(10), Duration::from_millis(20));
        assert_eq!(
            def.validate(),
            Err(WindowError::InvalidSlide { slide: 20, size: 10 })
        );
    }

    #[test]
    fn test_session_zero_gap_rejected() {
        let def = WindowDefinition {
            kind: WindowKind::Session { gap_ms: 0 },
            time_characteristic: TimeCharacteristic::EventTime,
            allowed_lateness_ms: 0,
        };
        assert_eq!(def.validate(), Err(WindowError::ZeroGap(0)));
    }

    #[test]
    fn test_range_contains_is_half_open() {
        let range = SliceRange::new(1000, 2000);
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
        assert!(!range.contains(999));
    }

    #[test]
    fn test_range_overlap_and_union() {
        let a = SliceRange::new(0, 10);
        let b = SliceRange::new(5, 15);
        let c = SliceRange::new(10, 20);

        assert!(a.overlaps(&b));
        // Half-open ranges touching at a boundary do not overlap.
        assert!(!a.overlaps(&c));
        assert_eq!(a.union(&b), SliceRange::new(0, 15));
    }

    #[test]
    fn test_range_key_round_trip() {
        let range = SliceRange::new(-1000, 2000);
        let key = range.to_key();
        assert_eq!(SliceRange::from_key(&key), Some(range));
        assert_eq!(SliceRange::from_key(&key[..8]), None);
    }

    #[test]
    fn test_range_ordering_is_start_major() {
        let mut ranges = vec![
            SliceRange::new(20, 30),
            SliceRange::new(0, 10),
            SliceRange::new(0, 5),
        ];
        ranges.sort();
        assert_eq!(ranges[0], SliceRange::new(0, 5));
        assert_eq!(ranges[1], SliceRange::new(0, 10));
        assert_eq!(ranges[2], SliceRange::new(20, 30));
    }
}
