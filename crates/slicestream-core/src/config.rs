//! # Engine Configuration
//!
//! Configuration for a single window-operator instance. There is no global
//! or static engine state: every component receives an [`EngineContext`] at
//! construction, with init and teardown tied to the operator instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with records that arrive too late to be accepted.
///
/// A record is "too late" when its timestamp is below
/// `global_watermark - allowed_lateness`. Such records are never merged into
/// a slice; the choice is between dropping them silently (counted) or
/// routing them to a named side output for separate processing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LateDataPolicy {
    /// Drop too-late records, counting them in the handler metrics.
    #[default]
    Drop,
    /// Route too-late records to a named side output.
    SideOutput(String),
}

impl LateDataPolicy {
    /// Returns the side output name, if configured.
    #[must_use]
    pub fn side_output(&self) -> Option<&str> {
        match self {
            Self::Drop => None,
            Self::SideOutput(name) => Some(name),
        }
    }
}

/// How numeric accumulator overflow is surfaced.
///
/// Sum and average accumulate in `i128`, so overflow is only reachable with
/// pathological input, but it is never silent wraparound either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Emit the window result with a null value and an overflow flag.
    #[default]
    FailWindow,
    /// Clamp the result to the representable range, still flagged.
    Saturate,
}

/// What happens to open slices when the operator shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Force-trigger all open slices so no ingested state is lost.
    #[default]
    Flush,
    /// Discard open slices without emitting.
    Discard,
}

/// Configuration for one window-operator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Grace period after the watermark during which late records are still
    /// accepted and merged into their slice.
    pub allowed_lateness: Duration,
    /// Handling of records below the lateness bound.
    pub late_data: LateDataPolicy,
    /// Handling of numeric accumulator overflow.
    pub overflow: OverflowPolicy,
    /// Handling of open slices on shutdown.
    pub shutdown: ShutdownMode,
    /// Grace period the merging role waits for missing sources before firing
    /// a window with a partial-source warning. `None` means wait
    /// indefinitely for all expected sources.
    pub merge_grace: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_lateness: Duration::ZERO,
            late_data: LateDataPolicy::default(),
            overflow: OverflowPolicy::default(),
            shutdown: ShutdownMode::default(),
            merge_grace: None,
        }
    }
}

impl EngineConfig {
    /// Sets the allowed lateness.
    #[must_use]
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    /// Sets the late-data policy.
    #[must_use]
    pub fn with_late_data(mut self, policy: LateDataPolicy) -> Self {
        self.late_data = policy;
        self
    }

    /// Sets the overflow policy.
    #[must_use]
    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Sets the shutdown mode.
    #[must_use]
    pub fn with_shutdown(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }

    /// Sets the merging-role grace period.
    #[must_use]
    pub fn with_merge_grace(mut self, grace: Duration) -> Self {
        self.merge_grace = Some(grace);
        self
    }

    /// Returns the allowed lateness in milliseconds.
    ///
    /// # Panics
    ///
    /// Panics if the configured lateness does not fit in `i64` milliseconds.
    #[must_use]
    pub fn allowed_lateness_ms(&self) -> i64 {
        i64::try_from(self.allowed_lateness.as_millis()).expect("lateness must fit in i64")
    }
}

/// Per-operator-instance context passed to every component at construction.
///
/// Replaces any notion of global engine state; teardown happens when the
/// owning operator instance is dropped.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    /// Configuration for this operator instance.
    pub config: EngineConfig,
}

impl EngineContext {
    /// Creates a context from a configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.allowed_lateness, Duration::ZERO);
        assert_eq!(config.late_data, LateDataPolicy::Drop);
        assert_eq!(config.overflow, OverflowPolicy::FailWindow);
        assert_eq!(config.shutdown, ShutdownMode::Flush);
        assert!(config.merge_grace.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = EngineConfig::default()
            .with_allowed_lateness(Duration::from_millis(500))
            .with_late_data(LateDataPolicy::SideOutput("late_events".to_string()))
            .with_overflow(OverflowPolicy::Saturate)
            .with_shutdown(ShutdownMode::Discard)
            .with_merge_grace(Duration::from_secs(5));

        assert_eq!(config.allowed_lateness_ms(), 500);
        assert_eq!(config.late_data.side_output(), Some("late_events"));
        assert_eq!(config.overflow, OverflowPolicy::Saturate);
        assert_eq!(config.shutdown, ShutdownMode::Discard);
        assert_eq!(config.merge_grace, Some(Duration::from_secs(5)));
    }
}
