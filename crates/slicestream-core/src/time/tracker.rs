//! # Per-Origin Watermark Tracking
//!
//! Tracks event-time progress per input origin and derives the global
//! watermark as the minimum over all known origins. An origin that has not
//! yet reported holds the global watermark at `i64::MIN` — slices cannot be
//! finalized until every expected origin has made progress.

use super::Watermark;
use fxhash::FxHashMap;

/// Identifier for one input origin (a partition, source instance, or
/// upstream operator instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId(pub u32);

/// Classification of a record timestamp against the global watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lateness {
    /// At or after the global watermark.
    OnTime,
    /// Before the watermark but within the allowed lateness; accepted and
    /// merged into its (possibly already-triggered-but-retained) slice.
    Late,
    /// Before `watermark - allowed_lateness`; dropped with a counted metric.
    TooLate,
}

#[derive(Debug)]
struct OriginState {
    watermark: i64,
    idle: bool,
}

/// Tracks watermarks across multiple input origins.
///
/// Per-origin watermarks are monotonic: a candidate lower than the origin's
/// current watermark is ignored, never regresses. The global watermark is
/// the minimum over all non-idle origins.
///
/// # Example
///
/// ```rust
/// use slicestream_core::time::{Lateness, OriginId, Watermark, WatermarkTracker};
///
/// let mut tracker = WatermarkTracker::new([OriginId(0), OriginId(1)], 100);
/// tracker.update_origin(OriginId(0), 1000);
/// tracker.update_origin(OriginId(1), 2000);
///
/// assert_eq!(tracker.global_watermark(), Watermark::new(1000));
/// assert_eq!(tracker.classify(950), Lateness::Late);
/// assert_eq!(tracker.classify(899), Lateness::TooLate);
/// ```
#[derive(Debug)]
pub struct WatermarkTracker {
    origins: FxHashMap<OriginId, OriginState>,
    global: i64,
    allowed_lateness_ms: i64,
}

impl WatermarkTracker {
    /// Creates a tracker for the given origins with an allowed lateness in
    /// milliseconds.
    #[must_use]
    pub fn new(origins: impl IntoIterator<Item = OriginId>, allowed_lateness_ms: i64) -> Self {
        let origins: FxHashMap<OriginId, OriginState> = origins
            .into_iter()
            .map(|id| {
                (
                    id,
                    OriginState {
                        watermark: i64::MIN,
                        idle: false,
                    },
                )
            })
            .collect();
        Self {
            origins,
            global: i64::MIN,
            allowed_lateness_ms,
        }
    }

    /// Registers an additional origin.
    ///
    /// A freshly registered origin has not reported and therefore holds the
    /// global watermark at `i64::MIN` until its first update.
    pub fn register_origin(&mut self, origin: OriginId) {
        self.origins.entry(origin).or_insert(OriginState {
            watermark: i64::MIN,
            idle: false,
        });
    }

    /// Updates the watermark for one origin.
    ///
    /// Monotonic per origin: candidates at or below the origin's current
    /// watermark are ignored. Returns `Some(watermark)` when the global
    /// watermark advances. Unknown origins are registered on first update.
    pub fn update_origin(&mut self, origin: OriginId, candidate: i64) -> Option<Watermark> {
        let state = self.origins.entry(origin).or_insert(OriginState {
            watermark: i64::MIN,
            idle: false,
        });
        state.idle = false;
        if candidate <= state.watermark {
            return None;
        }
        state.watermark = candidate;
        self.recompute_global()
    }

    /// Marks an origin as idle, excluding it from the global minimum so a
    /// stalled source cannot block progress forever.
    pub fn mark_idle(&mut self, origin: OriginId) -> Option<Watermark> {
        if let Some(state) = self.origins.get_mut(&origin) {
            state.idle = true;
            return self.recompute_global();
        }
        None
    }

    /// Returns the current global watermark, `i64::MIN` if any origin has
    /// not reported.
    #[must_use]
    pub fn global_watermark(&self) -> Watermark {
        Watermark::new(self.global)
    }

    /// Returns the watermark of one origin, if known.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<i64> {
        self.origins.get(&origin).map(|s| s.watermark)
    }

    /// Returns the number of tracked origins.
    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    /// Returns the allowed lateness in milliseconds.
    #[must_use]
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness_ms
    }

    /// Classifies a record timestamp against the global watermark.
    ///
    /// Records in `[global - lateness, global)` are late but accepted;
    /// records below that bound are too late and must be dropped.
    #[must_use]
    pub fn classify(&self, timestamp: i64) -> Lateness {
        Self::classify_against(self.global, self.allowed_lateness_ms, timestamp)
    }

    /// Classifies a timestamp against an explicit watermark value.
    ///
    /// Used by callers that cache the global watermark outside the tracker's
    /// lock for the ingestion hot path.
    #[must_use]
    pub fn classify_against(global: i64, allowed_lateness_ms: i64, timestamp: i64) -> Lateness {
        if global == i64::MIN || timestamp >= global {
            return Lateness::OnTime;
        }
        if timestamp >= global.saturating_sub(allowed_lateness_ms) {
            Lateness::Late
        } else {
            Lateness::TooLate
        }
    }

    fn recompute_global(&mut self) -> Option<Watermark> {
        let min = self
            .origins
            .values()
            .filter(|s| !s.idle)
            .map(|s| s.watermark)
            .min()
            // All origins idle: progress follows the furthest one.
            .unwrap_or_else(|| {
                self.origins
                    .values()
                    .map(|s| s.watermark)
                    .max()
                    .unwrap_or(i64::MIN)
            });
        if min > self.global {
            self.global = min;
            Some(Watermark::new(min))
        } else {
            None
        }
    }
}
