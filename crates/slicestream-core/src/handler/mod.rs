//! # Window Handler
//!
//! The per-operator-instance coordinator: ingest record batches, track
//! watermarks, trigger slices, lower states, emit results.
//!
//! The handler exposes a `&self` API. Worker threads ingest concurrently;
//! triggering runs on its own path (`advance_watermark` / `poll`) and never
//! blocks ingestion — the structural store lock is only taken for handle
//! bookkeeping, and lateness classification on the hot path reads a cached
//! atomic watermark.
//!
//! Per-record problems (malformed timestamps, too-late arrivals, aggregate
//! overflow) are counted, logged, and routed per policy; they never abort
//! the query. Fatal errors are reserved for store invariant violations.

#[cfg(test)]
mod tests;

use crate::aggregate::{AggregationFunction, ScalarResult};
use crate::config::{EngineContext, LateDataPolicy, OverflowPolicy, ShutdownMode};
use crate::slice::{Slice, SliceStore, StoreError};
use crate::time::{Lateness, OriginId, TimestampExtractor, WatermarkTracker};
use crate::trigger::{
    EventTimePolicy, TriggerContext, TriggerDecision, TriggerPolicy, WindowTriggerTask,
};
use crate::window::{SliceAssigner, SliceRange, WindowDefinition};
use arrow_array::builder::{Float64Builder, Int64Builder, UInt64Builder};
use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Column layout of ingested record batches.
#[derive(Debug, Clone, Copy)]
pub struct RecordColumns {
    /// Event-time column (`Int64` unix milliseconds)
    pub timestamp: usize,
    /// Grouping key column (`Int64`)
    pub key: usize,
    /// Aggregated value column (`Int64`)
    pub value: usize,
}

impl Default for RecordColumns {
    fn default() -> Self {
        Self {
            timestamp: 0,
            key: 1,
            value: 2,
        }
    }
}

/// Per-batch ingestion outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Rows merged into slices
    pub accepted: u64,
    /// Rows with unusable timestamp, key, or value
    pub malformed: u64,
    /// Rows below the lateness bound, dropped or side-output
    pub too_late: u64,
    /// Rows behind the watermark but within allowed lateness, merged
    pub late_accepted: u64,
    /// Row indexes routed to the side output, when one is configured
    pub side_output: Vec<usize>,
}

/// Flags attached to an emitted result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultFlags {
    /// An aggregate overflowed while computing this window
    pub overflow: bool,
    /// The merging role fired before all expected sources delivered
    pub partial_sources: bool,
    /// Early snapshot; the final result for this range is still to come
    pub intermediate: bool,
}

/// One `(window, key)` aggregate emission.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult {
    /// The window's time range
    pub range: SliceRange,
    /// Grouping key
    pub key: i64,
    /// Lowered aggregate value
    pub value: ScalarResult,
    /// Result metadata
    pub flags: ResultFlags,
}

/// Monotonic operational counters for one handler.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    records: AtomicU64,
    malformed: AtomicU64,
    too_late_dropped: AtomicU64,
    late_accepted: AtomicU64,
    overflows: AtomicU64,
    windows_fired: AtomicU64,
    intermediate_fired: AtomicU64,
}

impl HandlerMetrics {
    /// Rows seen by ingest.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Rows dropped for unusable timestamp/key/value.
    #[must_use]
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Rows dropped (or side-output) below the lateness bound.
    #[must_use]
    pub fn too_late_dropped(&self) -> u64 {
        self.too_late_dropped.load(Ordering::Relaxed)
    }

    /// Rows accepted behind the watermark.
    #[must_use]
    pub fn late_accepted(&self) -> u64 {
        self.late_accepted.load(Ordering::Relaxed)
    }

    /// Combines that overflowed.
    #[must_use]
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Windows finally fired.
    #[must_use]
    pub fn windows_fired(&self) -> u64 {
        self.windows_fired.load(Ordering::Relaxed)
    }

    /// Intermediate snapshots fired.
    #[must_use]
    pub fn intermediate_fired(&self) -> u64 {
        self.intermediate_fired.load(Ordering::Relaxed)
    }
}

/// Stateful windowed-aggregation coordinator for one operator instance.
///
/// # Example
///
/// ```rust
/// use slicestream_core::aggregate::Sum;
/// use slicestream_core::config::EngineContext;
/// use slicestream_core::handler::{RecordColumns, WindowHandler};
/// use slicestream_core::window::WindowDefinition;
/// use std::time::Duration;
///
/// let handler = WindowHandler::new(
///     EngineContext::default(),
///     WindowDefinition::tumbling(Duration::from_millis(10)),
///     Sum::new(),
///     RecordColumns::default(),
/// ).unwrap();
/// assert_eq!(handler.metrics().records(), 0);
/// ```
pub struct WindowHandler<F: AggregationFunction> {
    context: EngineContext,
    definition: WindowDefinition,
    assigner: SliceAssigner,
    columns: RecordColumns,
    extractor: TimestampExtractor,
    function: Arc<F>,
    store: SliceStore<F>,
    tracker: Mutex<WatermarkTracker>,
    // Global watermark mirrored outside the tracker lock for the ingest
    // hot path.
    cached_watermark: AtomicI64,
    policy: Box<dyn TriggerPolicy>,
    metrics: HandlerMetrics,
}

impl<F: AggregationFunction> std::fmt::Debug for WindowHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHandler")
            .field("definition", &self.definition)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl<F: AggregationFunction> WindowHandler<F> {
    /// Creates a handler, validating the window definition.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Window`] for an invalid definition.
    pub fn new(
        context: EngineContext,
        definition: WindowDefinition,
        function: F,
        columns: RecordColumns,
    ) -> Result<Self, crate::Error> {
        let assigner = SliceAssigner::new(definition)?;
        let lateness = definition
            .allowed_lateness_ms
            .max(context.config.allowed_lateness_ms());
        let function = Arc::new(function);
        Ok(Self {
            context,
            definition,
            assigner,
            columns,
            extractor: TimestampExtractor::new(columns.timestamp),
            store: SliceStore::new(Arc::clone(&function), lateness),
            function,
            tracker: Mutex::new(WatermarkTracker::new([], lateness)),
            cached_watermark: AtomicI64::new(i64::MIN),
            policy: Box::new(EventTimePolicy),
            metrics: HandlerMetrics::default(),
        })
    }

    /// Replaces the trigger policy. Event-time finalization stays on the
    /// watermark path regardless; the policy adds or reshapes early firing.
    #[must_use]
    pub fn with_policy(mut self, policy: Box<dyn TriggerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Registers an input origin. Origins are also registered implicitly
    /// by their first watermark; explicit registration makes an origin
    /// block the global watermark before it has reported.
    pub fn register_origin(&self, origin: OriginId) {
        self.tracker.lock().register_origin(origin);
    }

    /// Returns the handler's metrics.
    #[must_use]
    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    /// Returns the window definition.
    #[must_use]
    pub fn definition(&self) -> &WindowDefinition {
        &self.definition
    }

    /// Returns the slice store, for the distributed pipeline roles.
    #[must_use]
    pub fn store(&self) -> &SliceStore<F> {
        &self.store
    }

    /// Effective allowed lateness in milliseconds.
    #[must_use]
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.definition
            .allowed_lateness_ms
            .max(self.context.config.allowed_lateness_ms())
    }

    fn int64_column<'a>(
        batch: &'a RecordBatch,
        column: usize,
    ) -> Option<&'a arrow_array::PrimitiveArray<Int64Type>> {
        if column >= batch.num_columns() {
            return None;
        }
        batch.column(column).as_primitive_opt::<Int64Type>()
    }

    /// Ingests one record batch from an origin.
    ///
    /// Rows are classified against the cached global watermark, assigned to
    /// slices, and merged. Session definitions merge overlapping slices
    /// after the batch.
    ///
    /// # Errors
    ///
    /// Per-record problems are counted in the report, never returned. An
    /// `Err` here means a store invariant violation; the operator instance
    /// must be restarted.
    pub fn ingest(&self, batch: &RecordBatch, origin: OriginId) -> Result<IngestReport, crate::Error> {
        let mut report = IngestReport::default();
        let keys = Self::int64_column(batch, self.columns.key);
        let values = Self::int64_column(batch, self.columns.value);
        let global = self.cached_watermark.load(Ordering::Acquire);
        let lateness = self.allowed_lateness_ms();
        let processing_now = now_ms();

        for row in 0..batch.num_rows() {
            self.metrics.records.fetch_add(1, Ordering::Relaxed);

            let event_ts = match self.extractor.extract_row(batch, row) {
                Ok(ts) => ts,
                Err(e) => {
                    self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                    report.malformed += 1;
                    tracing::debug!(row, error = %e, "dropping record with malformed timestamp");
                    continue;
                }
            };
            let (key, value) = match (
                keys.filter(|a| !a.is_null(row)).map(|a| a.value(row)),
                values.filter(|a| !a.is_null(row)).map(|a| a.value(row)),
            ) {
                (Some(k), Some(v)) => (k, v),
                _ => {
                    self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                    report.malformed += 1;
                    continue;
                }
            };

            let assign_ts = match self.definition.time_characteristic {
                crate::time::TimeCharacteristic::EventTime => event_ts,
                crate::time::TimeCharacteristic::ProcessingTime => processing_now,
            };

            match WatermarkTracker::classify_against(global, lateness, event_ts) {
                Lateness::TooLate => {
                    self.metrics.too_late_dropped.fetch_add(1, Ordering::Relaxed);
                    report.too_late += 1;
                    match &self.context.config.late_data {
                        LateDataPolicy::Drop => {
                            tracing::debug!(origin = origin.0, event_ts, global, "dropping too-late record");
                        }
                        LateDataPolicy::SideOutput(name) => {
                            tracing::debug!(origin = origin.0, event_ts, side_output = %name, "routing too-late record");
                            report.side_output.push(row);
                        }
                    }
                    continue;
                }
                Lateness::Late => {
                    self.metrics.late_accepted.fetch_add(1, Ordering::Relaxed);
                    report.late_accepted += 1;
                }
                Lateness::OnTime => {}
            }

            for range in self.assigner.assign(assign_ts) {
                // A concurrent session merge can reclaim the slice between
                // lookup and update; re-resolve and try again.
                loop {
                    let id = self.store.get_or_create(range)?;
                    match self.store.update(id, key, value) {
                        Ok(()) => break,
                        Err(crate::Error::Aggregate(e)) => {
                            self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(key, error = %e, "aggregate overflow, window will be flagged");
                            break;
                        }
                        Err(crate::Error::Store(StoreError::StaleHandle(_))) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            report.accepted += 1;
        }

        if self.definition.is_session() {
            self.store.merge_overlapping()?;
        }
        Ok(report)
    }

    /// Advances one origin's watermark and fires windows that became final.
    ///
    /// Results are ordered by window start; keys within a window ascend.
    ///
    /// # Errors
    ///
    /// Returns store invariant violations; per-window overflow is surfaced
    /// through [`ResultFlags`] per the configured [`OverflowPolicy`].
    pub fn advance_watermark(
        &self,
        origin: OriginId,
        watermark: i64,
    ) -> Result<Vec<WindowResult>, crate::Error> {
        let advanced = {
            let mut tracker = self.tracker.lock();
            tracker.update_origin(origin, watermark)
        };
        let Some(global) = advanced else {
            return Ok(Vec::new());
        };
        self.cached_watermark.store(global.timestamp(), Ordering::Release);
        self.fire_ready(global.timestamp())
    }

    fn fire_ready(&self, up_to: i64) -> Result<Vec<WindowResult>, crate::Error> {
        let mut results = Vec::new();
        for slice in self.store.slices_ready_before(up_to) {
            let task = WindowTriggerTask {
                sequence_number: slice.sequence_number(),
                range: slice.range(),
            };
            self.fire_final(task, &slice, ResultFlags::default(), &mut results);
        }
        Ok(results)
    }

    fn fire_final(
        &self,
        task: WindowTriggerTask,
        slice: &Arc<Slice<F::State>>,
        base_flags: ResultFlags,
        results: &mut Vec<WindowResult>,
    ) {
        tracing::debug!(
            sequence = task.sequence_number,
            range = ?task.range,
            "firing window"
        );
        // The slice is already out of the store; wait out a concurrent
        // intermediate firing, which is non-blocking by contract.
        while !slice.firing().try_claim_firing() {
            if slice.firing().is_finalized() {
                return;
            }
            std::hint::spin_loop();
        }
        let mut entries = slice.take_entries();
        entries.sort_unstable_by_key(|(k, _)| *k);
        let flags = ResultFlags {
            overflow: base_flags.overflow || slice.overflowed(),
            ..base_flags
        };
        for (key, state) in entries {
            results.push(self.lower_entry(slice.range(), key, &state, flags));
        }
        slice.firing().finalize();
        self.metrics.windows_fired.fetch_add(1, Ordering::Relaxed);
    }

    fn lower_entry(
        &self,
        range: SliceRange,
        key: i64,
        state: &F::State,
        mut flags: ResultFlags,
    ) -> WindowResult {
        let value = match self.function.lower(state) {
            Ok(v) => v,
            Err(e) => {
                self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
                flags.overflow = true;
                match self.context.config.overflow {
                    OverflowPolicy::FailWindow => {
                        tracing::warn!(?range, key, error = %e, "window failed on overflow");
                        ScalarResult::Null
                    }
                    OverflowPolicy::Saturate => self.function.lower_saturating(state),
                }
            }
        };
        WindowResult {
            range,
            key,
            value,
            flags,
        }
    }

    /// Evaluates the trigger policy against processing time, emitting
    /// intermediate snapshots without consuming slice state.
    ///
    /// Under [`crate::time::TimeCharacteristic::ProcessingTime`] this is
    /// also the finalization path: slices past `end + lateness` of wall
    /// clock fire finally.
    ///
    /// # Errors
    ///
    /// Returns store invariant violations only.
    pub fn poll(&self, processing_time: i64) -> Result<Vec<WindowResult>, crate::Error> {
        let mut results = Vec::new();

        if self.definition.time_characteristic == crate::time::TimeCharacteristic::ProcessingTime {
            for slice in self.store.slices_ready_before(processing_time) {
                let task = WindowTriggerTask {
                    sequence_number: slice.sequence_number(),
                    range: slice.range(),
                };
                self.fire_final(task, &slice, ResultFlags::default(), &mut results);
            }
        }

        let watermark = self.cached_watermark.load(Ordering::Acquire);
        for (_id, slice) in self.store.open_slices() {
            let ctx = TriggerContext {
                range: slice.range(),
                record_count: slice.record_count(),
                watermark,
                processing_time,
                last_intermediate_fire: slice.last_intermediate_fire(),
                allowed_lateness_ms: self.allowed_lateness_ms(),
            };
            match self.policy.evaluate(&ctx) {
                TriggerDecision::Hold => {}
                TriggerDecision::FireIntermediate | TriggerDecision::FireFinal => {
                    if !slice.firing().try_claim_firing() {
                        continue;
                    }
                    let mut entries = slice.snapshot_entries();
                    entries.sort_unstable_by_key(|(k, _)| *k);
                    let flags = ResultFlags {
                        overflow: slice.overflowed(),
                        intermediate: true,
                        ..ResultFlags::default()
                    };
                    for (key, state) in entries {
                        results.push(self.lower_entry(slice.range(), key, &state, flags));
                    }
                    slice.set_last_intermediate_fire(processing_time);
                    slice.firing().release_intermediate();
                    self.metrics.intermediate_fired.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(results)
    }

    /// Drains the handler on shutdown.
    ///
    /// [`ShutdownMode::Flush`] force-fires every open slice so ingested
    /// state is never silently lost; [`ShutdownMode::Discard`] drops open
    /// slices without emitting.
    ///
    /// # Errors
    ///
    /// Returns store invariant violations only.
    pub fn close(&self, mode: ShutdownMode) -> Result<Vec<WindowResult>, crate::Error> {
        let mut results = Vec::new();
        match mode {
            ShutdownMode::Flush => {
                let drained: Vec<_> = self.store.drain_all().collect();
                if !drained.is_empty() {
                    tracing::warn!(slices = drained.len(), "force-flushing open slices on shutdown");
                }
                for slice in drained {
                    let task = WindowTriggerTask {
                        sequence_number: slice.sequence_number(),
                        range: slice.range(),
                    };
                    self.fire_final(task, &slice, ResultFlags::default(), &mut results);
                }
            }
            ShutdownMode::Discard => {
                let dropped = self.store.drain_all().count();
                if dropped > 0 {
                    tracing::warn!(slices = dropped, "discarding open slices on shutdown");
                }
            }
        }
        Ok(results)
    }

    /// Builds the Arrow output batch for a set of results.
    ///
    /// Schema: `window_start: Int64, window_end: Int64, key: Int64,
    /// value: <function output type>` (value nullable).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Arrow`] if batch construction fails.
    pub fn results_to_batch(&self, results: &[WindowResult]) -> Result<RecordBatch, crate::Error> {
        let mut starts = Int64Builder::with_capacity(results.len());
        let mut ends = Int64Builder::with_capacity(results.len());
        let mut keys = Int64Builder::with_capacity(results.len());
        for r in results {
            starts.append_value(r.range.start);
            ends.append_value(r.range.end);
            keys.append_value(r.key);
        }

        let output_type = self.function.output_type();
        let values: ArrayRef = match output_type {
            DataType::UInt64 => {
                let mut b = UInt64Builder::with_capacity(results.len());
                for r in results {
                    match r.value {
                        ScalarResult::UInt64(v) => b.append_value(v),
                        _ => b.append_null(),
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Float64 => {
                let mut b = Float64Builder::with_capacity(results.len());
                for r in results {
                    match r.value.as_f64() {
                        Some(v) => b.append_value(v),
                        None => b.append_null(),
                    }
                }
                Arc::new(b.finish())
            }
            _ => {
                let mut b = Int64Builder::with_capacity(results.len());
                for r in results {
                    match r.value.as_i64() {
                        Some(v) => b.append_value(v),
                        None => b.append_null(),
                    }
                }
                Arc::new(b.finish())
            }
        };

        let schema = Arc::new(Schema::new(vec![
            Field::new("window_start", DataType::Int64, false),
            Field::new("window_end", DataType::Int64, false),
            Field::new("key", DataType::Int64, false),
            Field::new("value", values.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(starts.finish()),
                Arc::new(ends.finish()),
                Arc::new(keys.finish()),
                values,
            ],
        )?;
        Ok(batch)
    }
}

/// Wall-clock unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
