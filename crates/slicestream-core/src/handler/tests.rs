//! End-to-end handler scenarios: ingestion, lateness, triggering, sessions,
//! concurrency, and shutdown.

use super::*;
use crate::aggregate::{Count, Sum};
use crate::config::EngineConfig;
use crate::trigger::CountPolicy;
use crate::window::WindowDefinition;
use arrow_array::Int64Array;
use std::time::Duration;

fn batch(rows: &[(i64, i64, i64)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, true),
        Field::new("key", DataType::Int64, true),
        Field::new("value", DataType::Int64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
        ],
    )
    .unwrap()
}

fn sum_handler(def: WindowDefinition) -> WindowHandler<Sum> {
    WindowHandler::new(
        EngineContext::default(),
        def,
        Sum::new(),
        RecordColumns::default(),
    )
    .unwrap()
}

#[test]
fn test_tumbling_sum_two_windows() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));

    let report = handler
        .ingest(&batch(&[(1, 1, 5), (5, 1, 3), (12, 1, 7)]), OriginId(0))
        .unwrap();
    assert_eq!(report.accepted, 3);

    // Watermark 25 finalizes [0,10) and [10,20).
    let results = handler.advance_watermark(OriginId(0), 25).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].range, SliceRange::new(0, 10));
    assert_eq!(results[0].value, ScalarResult::Int64(8));
    assert_eq!(results[1].range, SliceRange::new(10, 20));
    assert_eq!(results[1].value, ScalarResult::Int64(7));
    assert!(!results[0].flags.intermediate);
    assert_eq!(handler.metrics().windows_fired(), 2);

    // Nothing left to fire.
    assert!(handler.advance_watermark(OriginId(0), 30).unwrap().is_empty());
}

#[test]
fn test_watermark_does_not_fire_open_window() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler.ingest(&batch(&[(22, 1, 1)]), OriginId(0)).unwrap();

    // [20,30) is not final at watermark 25.
    assert!(handler.advance_watermark(OriginId(0), 25).unwrap().is_empty());
    let results = handler.advance_watermark(OriginId(0), 30).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].range, SliceRange::new(20, 30));
}

#[test]
fn test_multi_origin_watermark_is_min() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler.register_origin(OriginId(0));
    handler.register_origin(OriginId(1));
    handler.ingest(&batch(&[(1, 1, 1)]), OriginId(0)).unwrap();

    // Only one origin reported: global stays at -infinity, nothing fires.
    assert!(handler.advance_watermark(OriginId(0), 100).unwrap().is_empty());
    let results = handler.advance_watermark(OriginId(1), 50).unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn test_lateness_acceptance_boundary() {
    let def = WindowDefinition::tumbling(Duration::from_millis(1000))
        .with_allowed_lateness(Duration::from_millis(100));
    let handler = sum_handler(def);

    handler.ingest(&batch(&[(10, 1, 1)]), OriginId(0)).unwrap();
    assert!(handler.advance_watermark(OriginId(0), 1000).unwrap().is_empty());

    // ts 899 < 1000 - 100: dropped. ts 900: late but accepted and merged.
    let report = handler
        .ingest(&batch(&[(899, 1, 50), (900, 1, 7)]), OriginId(0))
        .unwrap();
    assert_eq!(report.too_late, 1);
    assert_eq!(report.late_accepted, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(handler.metrics().too_late_dropped(), 1);

    // Retention holds [0,1000) until watermark 1100; the late record is in.
    let results = handler.advance_watermark(OriginId(0), 1100).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, ScalarResult::Int64(8));
}

#[test]
fn test_too_late_side_output_rows() {
    let config = EngineConfig::default()
        .with_late_data(crate::config::LateDataPolicy::SideOutput("late".to_string()));
    let def = WindowDefinition::tumbling(Duration::from_millis(10));
    let handler = WindowHandler::new(
        EngineContext::new(config),
        def,
        Sum::new(),
        RecordColumns::default(),
    )
    .unwrap();

    handler.advance_watermark(OriginId(0), 100).unwrap();
    let report = handler
        .ingest(&batch(&[(5, 1, 1), (105, 1, 1)]), OriginId(0))
        .unwrap();
    assert_eq!(report.side_output, vec![0]);
    assert_eq!(report.accepted, 1);
}

#[test]
fn test_malformed_rows_counted_not_fatal() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, true),
        Field::new("key", DataType::Int64, true),
        Field::new("value", DataType::Int64, true),
    ]));
    let bad = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![Some(1), None, Some(3)])),
            Arc::new(Int64Array::from(vec![Some(1), Some(1), None])),
            Arc::new(Int64Array::from(vec![Some(10), Some(10), Some(10)])),
        ],
    )
    .unwrap();

    let report = handler.ingest(&bad, OriginId(0)).unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.malformed, 2);
    assert_eq!(handler.metrics().malformed(), 2);
}

#[test]
fn test_session_windows_merge_and_stay_disjoint() {
    let def = WindowDefinition::session(Duration::from_millis(5));
    let handler = WindowHandler::new(
        EngineContext::default(),
        def,
        Count::new(),
        RecordColumns::default(),
    )
    .unwrap();

    // ts 0 and 3 chain into one session; ts 20 is past the gap.
    handler
        .ingest(&batch(&[(0, 1, 1), (3, 1, 1), (20, 1, 1)]), OriginId(0))
        .unwrap();

    let results = handler.advance_watermark(OriginId(0), 100).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].range, SliceRange::new(0, 8));
    assert_eq!(results[0].value, ScalarResult::UInt64(2));
    assert_eq!(results[1].range, SliceRange::new(20, 25));
    assert_eq!(results[1].value, ScalarResult::UInt64(1));
}

#[test]
fn test_count_policy_intermediate_then_final() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)))
        .with_policy(Box::new(CountPolicy { threshold: 2 }));

    handler
        .ingest(&batch(&[(1, 1, 4), (2, 1, 6)]), OriginId(0))
        .unwrap();

    // Early snapshot: flagged, non-consuming.
    let early = handler.poll(0).unwrap();
    assert_eq!(early.len(), 1);
    assert!(early[0].flags.intermediate);
    assert_eq!(early[0].value, ScalarResult::Int64(10));
    assert_eq!(handler.metrics().intermediate_fired(), 1);

    // Late record still merges after the early firing.
    handler.ingest(&batch(&[(3, 1, 5)]), OriginId(0)).unwrap();

    let finals = handler.advance_watermark(OriginId(0), 20).unwrap();
    assert_eq!(finals.len(), 1);
    assert!(!finals[0].flags.intermediate);
    assert_eq!(finals[0].value, ScalarResult::Int64(15));
}

#[test]
fn test_overflow_fail_window_emits_null_with_flag() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler
        .ingest(&batch(&[(1, 1, i64::MAX), (2, 1, 1)]), OriginId(0))
        .unwrap();

    let results = handler.advance_watermark(OriginId(0), 20).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].value.is_null());
    assert!(results[0].flags.overflow);
}

#[test]
fn test_overflow_saturate_clamps() {
    let config = EngineConfig::default().with_overflow(crate::config::OverflowPolicy::Saturate);
    let handler = WindowHandler::new(
        EngineContext::new(config),
        WindowDefinition::tumbling(Duration::from_millis(10)),
        Sum::new(),
        RecordColumns::default(),
    )
    .unwrap();
    handler
        .ingest(&batch(&[(1, 1, i64::MAX), (2, 1, 1)]), OriginId(0))
        .unwrap();

    let results = handler.advance_watermark(OriginId(0), 20).unwrap();
    assert_eq!(results[0].value, ScalarResult::Int64(i64::MAX));
    assert!(results[0].flags.overflow);
}

#[test]
fn test_close_flush_emits_open_slices() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler
        .ingest(&batch(&[(1, 1, 5), (15, 2, 3)]), OriginId(0))
        .unwrap();

    let results = handler.close(ShutdownMode::Flush).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].range.start, 0);
    assert_eq!(results[1].range.start, 10);
    assert!(handler.store().is_empty());
}

#[test]
fn test_close_discard_drops_open_slices() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler.ingest(&batch(&[(1, 1, 5)]), OriginId(0)).unwrap();

    let results = handler.close(ShutdownMode::Discard).unwrap();
    assert!(results.is_empty());
    assert!(handler.store().is_empty());
}

#[test]
fn test_concurrent_ingest_conserves_count() {
    let handler = WindowHandler::new(
        EngineContext::default(),
        WindowDefinition::tumbling(Duration::from_millis(10)),
        Count::new(),
        RecordColumns::default(),
    )
    .unwrap();

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 250;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let handler = &handler;
            scope.spawn(move || {
                let rows: Vec<(i64, i64, i64)> = (0..PER_THREAD)
                    .map(|i| ((t * PER_THREAD + i) % 100, i % 7, 1))
                    .collect();
                let report = handler.ingest(&batch(&rows), OriginId(0)).unwrap();
                assert_eq!(report.accepted, PER_THREAD as u64);
            });
        }
    });

    let results = handler.advance_watermark(OriginId(0), 1000).unwrap();
    let total: u64 = results
        .iter()
        .map(|r| match r.value {
            ScalarResult::UInt64(v) => v,
            _ => 0,
        })
        .sum();
    // Every ingested record is counted exactly once across all windows.
    assert_eq!(total, (THREADS * PER_THREAD) as u64);
}

#[test]
fn test_results_to_batch_schema_and_values() {
    let handler = sum_handler(WindowDefinition::tumbling(Duration::from_millis(10)));
    handler
        .ingest(&batch(&[(1, 1, 5), (2, 2, 7)]), OriginId(0))
        .unwrap();
    let results = handler.advance_watermark(OriginId(0), 20).unwrap();

    let out = handler.results_to_batch(&results).unwrap();
    assert_eq!(out.num_rows(), 2);
    assert_eq!(out.schema().field(0).name(), "window_start");
    assert_eq!(out.schema().field(3).name(), "value");
    assert_eq!(out.schema().field(3).data_type(), &DataType::Int64);

    let keys = out.column(2).as_primitive::<Int64Type>();
    let values = out.column(3).as_primitive::<Int64Type>();
    assert_eq!((keys.value(0), values.value(0)), (1, 5));
    assert_eq!((keys.value(1), values.value(1)), (2, 7));
}
