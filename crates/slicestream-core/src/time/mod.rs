//! # Time Module
//!
//! Event time, watermarks, and timestamp extraction.
//!
//! ## Concepts
//!
//! - **Event Time**: timestamp carried by the record itself
//! - **Processing Time**: wall-clock time at which the record is processed
//! - **Watermark**: assertion that no events with timestamp < watermark will
//!   arrive (beyond the allowed lateness)
//! - **Origin**: one input partition or upstream instance; the engine-visible
//!   global watermark is the minimum over all origins
//!
//! ## Watermark Tracking
//!
//! ```rust
//! use slicestream_core::time::{OriginId, Watermark, WatermarkTracker};
//!
//! let mut tracker = WatermarkTracker::new([OriginId(0), OriginId(1)], 0);
//! tracker.update_origin(OriginId(0), 5000);
//! let wm = tracker.update_origin(OriginId(1), 3000);
//!
//! // Global watermark is the minimum over origins
//! assert_eq!(wm, Some(Watermark::new(3000)));
//! ```

mod tracker;

pub use tracker::{Lateness, OriginId, WatermarkTracker};

use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, RecordBatch};

/// A watermark indicating event time progress.
///
/// Watermarks are monotonically non-decreasing assertions that no events
/// with timestamps earlier than the watermark will arrive. They drive
/// window triggering and late-event detection.
///
/// # Example
///
/// ```rust
/// use slicestream_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if an event is late relative to this watermark.
    ///
    /// An event is late if its timestamp is strictly less than the
    /// watermark timestamp.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns the minimum (earlier) of two watermarks.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self(i64::MIN)
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// Whether windows are driven by event time or processing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TimeCharacteristic {
    /// Use the timestamp carried by the record (default).
    #[default]
    EventTime,
    /// Use the wall-clock time at ingestion.
    ProcessingTime,
}

/// Errors that can occur in time operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// The record's timestamp could not be derived.
    #[error("malformed timestamp in column {column}, row {row}")]
    MalformedTimestamp {
        /// Column the extractor was configured with
        column: usize,
        /// Row index within the batch
        row: usize,
    },

    /// Watermark regression (going backwards)
    #[error("watermark regression: current={current}, new={new}")]
    WatermarkRegression {
        /// Current watermark value
        current: i64,
        /// Attempted new watermark value
        new: i64,
    },
}

/// Extracts millisecond event timestamps from a `RecordBatch` column.
///
/// The column must be a non-null `Int64` unix-millisecond value; anything
/// else is a [`TimeError::MalformedTimestamp`] for the affected row. The
/// record is then dropped or side-output per the operator's late-data
/// policy — extraction failures never abort the query.
#[derive(Debug, Clone, Copy)]
pub struct TimestampExtractor {
    column: usize,
}

impl TimestampExtractor {
    /// Creates an extractor reading the given column index.
    #[must_use]
    pub fn new(column: usize) -> Self {
        Self { column }
    }

    /// Returns the configured column index.
    #[must_use]
    pub fn column(&self) -> usize {
        self.column
    }

    /// Extracts the timestamp for one row.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::MalformedTimestamp`] if the column is missing,
    /// not `Int64`, or null at the row.
    pub fn extract_row(&self, batch: &RecordBatch, row: usize) -> Result<i64, TimeError> {
        let malformed = || TimeError::MalformedTimestamp {
            column: self.column,
            row,
        };
        if self.column >= batch.num_columns() || row >= batch.num_rows() {
            return Err(malformed());
        }
        let array = batch
            .column(self.column)
            .as_primitive_opt::<Int64Type>()
            .ok_or_else(malformed)?;
        if array.is_null(row) {
            return Err(malformed());
        }
        Ok(array.value(row))
    }
}
