//! Assignment of record timestamps to slice time ranges.

use super::{SliceRange, WindowDefinition, WindowError, WindowKind};
use smallvec::SmallVec;

/// Slice ranges a single record maps to. Sliding windows with a small
/// size/slide ratio stay on the stack.
pub type SliceRangeVec = SmallVec<[SliceRange; 4]>;

/// Maps record timestamps to the slice ranges they belong to.
///
/// Assignment is pure: the same timestamp always yields the same ranges for
/// a given definition. For session windows the assigner produces a
/// provisional single-record range; overlap resolution happens in the store.
///
/// # Example
///
/// ```rust
/// use slicestream_core::window::{SliceAssigner, SliceRange, WindowDefinition};
/// use std::time::Duration;
///
/// let assigner = SliceAssigner::new(WindowDefinition::tumbling(Duration::from_millis(10))).unwrap();
/// // Boundary timestamps belong to the range starting at the boundary.
/// assert_eq!(assigner.assign(10).as_slice(), &[SliceRange::new(10, 20)]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SliceAssigner {
    definition: WindowDefinition,
}

impl SliceAssigner {
    /// Creates an assigner, validating the definition.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError`] if the definition is invalid.
    pub fn new(definition: WindowDefinition) -> Result<Self, WindowError> {
        definition.validate()?;
        Ok(Self { definition })
    }

    /// Returns the window definition.
    #[must_use]
    pub fn definition(&self) -> &WindowDefinition {
        &self.definition
    }

    /// Returns the slice ranges the timestamp belongs to, ascending by start.
    #[must_use]
    pub fn assign(&self, timestamp: i64) -> SliceRangeVec {
        let mut ranges = SliceRangeVec::new();
        match self.definition.kind {
            WindowKind::Tumbling { size_ms } => {
                let start = floor_aligned(timestamp, size_ms);
                ranges.push(SliceRange::new(start, start + size_ms));
            }
            WindowKind::Sliding { size_ms, slide_ms } => {
                // Covering starts are the slide multiples in
                // (timestamp - size, timestamp].
                let mut start = floor_aligned(timestamp - size_ms, slide_ms) + slide_ms;
                while start <= timestamp {
                    ranges.push(SliceRange::new(start, start + size_ms));
                    start += slide_ms;
                }
            }
            WindowKind::Session { gap_ms } => {
                ranges.push(SliceRange::new(timestamp, timestamp + gap_ms));
            }
        }
        ranges
    }

    /// Returns the session gap, if this assigner defines session windows.
    #[must_use]
    pub fn session_gap_ms(&self) -> Option<i64> {
        match self.definition.kind {
            WindowKind::Session { gap_ms } => Some(gap_ms),
            _ => None,
        }
    }
}

/// Floors a timestamp to a multiple of `interval_ms`, correct for negative
/// timestamps (pre-epoch events).
#[inline]
fn floor_aligned(timestamp: i64, interval_ms: i64) -> i64 {
    let rem = timestamp % interval_ms;
    if rem < 0 {
        timestamp - rem - interval_ms
    } else {
        timestamp - rem
    }
}
