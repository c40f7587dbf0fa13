use std::collections::BTreeSet;
use std::sync::Arc;

use super::*;
use crate::buffer::{Buffer, BufferPool, BufferPoolConfig, BufferProvider};
use crate::slice::{SpillConfig, WindowId, WindowType};
use crate::time::{OriginId, SequenceData, Watermark, WatermarkError};

const RECORD_SIZE: usize = 16;

fn pool(buffer_size: usize, count: usize) -> BufferPool {
    BufferPool::new(
        BufferPoolConfig::builder()
            .buffer_size(buffer_size)
            .num_buffers(count)
            .build(),
    )
    .unwrap()
}

fn time_fn() -> TimeFunction {
    Arc::new(|record: &[u8]| i64::from_le_bytes(record[..8].try_into().unwrap()))
}

fn key_hash() -> KeyHashFunction {
    Arc::new(|record: &[u8]| u64::from_le_bytes(record[8..16].try_into().unwrap()))
}

fn key_eq() -> KeyEqFunction {
    Arc::new(|left: &[u8], right: &[u8]| left[8..16] == right[8..16])
}

fn decode(record: &[u8]) -> (i64, u64) {
    (
        i64::from_le_bytes(record[..8].try_into().unwrap()),
        u64::from_le_bytes(record[8..16].try_into().unwrap()),
    )
}

fn fill(
    input: &BufferPool,
    records: &[(i64, u64)],
    origin: u64,
    sequence: u64,
    watermark: i64,
) -> Buffer {
    let mut buffer = input.try_acquire().unwrap();
    let data = buffer.as_mut_slice().unwrap();
    for (i, (ts, key)) in records.iter().enumerate() {
        let offset = i * RECORD_SIZE;
        data[offset..offset + 8].copy_from_slice(&ts.to_le_bytes());
        data[offset + 8..offset + 16].copy_from_slice(&key.to_le_bytes());
    }
    buffer.set_tuple_count(records.len() as u64);
    buffer.set_origin(OriginId(origin));
    buffer.set_watermark(Watermark::new(watermark));
    buffer.set_sequence_data(SequenceData::new(sequence));
    buffer
}

fn at(timestamps: &[i64]) -> Vec<(i64, u64)> {
    timestamps.iter().map(|&ts| (ts, 0)).collect()
}

fn tumbling(size: i64) -> OperatorConfigBuilder {
    OperatorConfig::builder()
        .window(WindowType::Tumbling { size })
        .record_size(RECORD_SIZE)
}

fn window_handler(config: OperatorConfig, pages: &BufferPool) -> WindowOperatorHandler {
    let handler = WindowOperatorHandler::new(config, Arc::new(pages.clone()), time_fn()).unwrap();
    handler.start().unwrap();
    handler
}

fn tasks<T>(outputs: OutputVec<T>) -> Vec<T> {
    outputs.into_iter().filter_map(Output::into_task).collect()
}

fn timestamps(task: &WindowTriggerTask) -> Vec<i64> {
    task.records().map(|record| decode(record).0).collect()
}

#[test]
fn test_window_triggers_only_completed_windows() {
    let input = pool(1024, 8);
    let handler = window_handler(tumbling(10).build(), &pool(256, 64));

    let buffer = fill(&input, &at(&[1, 5, 9, 12, 15]), 0, 0, 15);
    let first = tasks(handler.process(0, &buffer).unwrap());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].window(), WindowId::new(0, 10));
    assert_eq!(timestamps(&first[0]), vec![1, 5, 9]);
    assert_eq!(first[0].metadata().sequence_number, 0);
    assert_eq!(first[0].metadata().watermark, Watermark::new(15));

    let buffer = fill(&input, &at(&[18]), 0, 1, 25);
    let second = tasks(handler.process(0, &buffer).unwrap());
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].window(), WindowId::new(10, 20));
    assert_eq!(timestamps(&second[0]), vec![12, 15, 18]);
    assert_eq!(second[0].metadata().sequence_number, 1);
}

#[test]
fn test_window_task_fold() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(100).build(), &pool(256, 16));
    let records: Vec<(i64, u64)> = (0..10).map(|i| (i, 10 * i as u64)).collect();
    let buffer = fill(&input, &records, 0, 0, 100);

    let triggered = tasks(handler.process(0, &buffer).unwrap());
    let sum = triggered[0].fold(0u64, |acc, record| acc + decode(record).1);
    assert_eq!(sum, 450);
    assert_eq!(triggered[0].len(), 10);
    assert!(!triggered[0].is_empty());
}

#[test]
fn test_late_records_are_dropped_and_counted() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));

    handler.process(0, &fill(&input, &[], 0, 0, 20)).unwrap();
    let outputs = handler.process(0, &fill(&input, &at(&[5, 25]), 0, 1, 20)).unwrap();
    assert!(outputs.is_empty());

    let metrics = handler.metrics();
    assert_eq!(metrics.late_records_dropped, 1);
    assert_eq!(metrics.late_records_side_output, 0);
    assert_eq!(metrics.tuples_processed, 2);
    assert_eq!(metrics.buffers_processed, 2);
    assert_eq!(handler.slice_store().num_slices(), 1);
}

#[test]
fn test_late_records_routed_to_side_output() {
    let input = pool(1024, 4);
    let config = tumbling(10)
        .late_data(LateDataConfig::with_side_output("late"))
        .build();
    let handler = window_handler(config, &pool(256, 16));

    handler.process(0, &fill(&input, &[], 0, 0, 20)).unwrap();
    let outputs = handler
        .process(0, &fill(&input, &[(5, 7), (25, 8)], 0, 1, 20))
        .unwrap();
    let late: Vec<LateRecord> = outputs
        .into_iter()
        .filter_map(|output| match output {
            Output::LateRecord(record) => Some(record),
            Output::Task(_) => None,
        })
        .collect();
    assert_eq!(late.len(), 1);
    assert_eq!(&*late[0].side_output, "late");
    assert_eq!(late[0].timestamp, 5);
    assert_eq!(late[0].watermark, Watermark::new(20));
    assert_eq!(decode(&late[0].record), (5, 7));
    assert_eq!(handler.metrics().late_records_side_output, 1);
}

#[test]
fn test_record_at_watermark_is_not_late() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    handler.process(0, &fill(&input, &[], 0, 0, 20)).unwrap();
    handler.process(0, &fill(&input, &at(&[20]), 0, 1, 20)).unwrap();
    assert_eq!(handler.metrics().late_records(), 0);
    assert_eq!(handler.slice_store().num_slices(), 1);
}

#[test]
fn test_slowest_origin_holds_back_trigger() {
    let input = pool(1024, 4);
    let config = tumbling(10).origins([OriginId(0), OriginId(1)]).build();
    let handler = window_handler(config, &pool(256, 16));

    let held = handler.process(0, &fill(&input, &at(&[5]), 0, 0, 50)).unwrap();
    assert!(held.is_empty());
    assert_eq!(handler.current_watermark(), Watermark::MIN);

    let released = tasks(handler.process(0, &fill(&input, &at(&[6]), 1, 0, 12)).unwrap());
    assert_eq!(handler.current_watermark(), Watermark::new(12));
    assert_eq!(released.len(), 1);
    assert_eq!(timestamps(&released[0]), vec![5, 6]);
}

#[test]
fn test_sequence_regression_is_reported() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    handler.process(0, &fill(&input, &at(&[1]), 0, 0, 0)).unwrap();
    let result = handler.process(0, &fill(&input, &at(&[2]), 0, 0, 0));
    assert!(matches!(
        result,
        Err(OperatorError::Watermark(WatermarkError::SequenceRegression {
            sequence: 0,
            expected: 1,
            ..
        }))
    ));
}

#[test]
fn test_unknown_origin_is_reported() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    let result = handler.process(0, &fill(&input, &at(&[1]), 9, 0, 0));
    assert!(matches!(
        result,
        Err(OperatorError::Watermark(WatermarkError::UnknownOrigin(OriginId(9))))
    ));
}

#[test]
fn test_malformed_buffer_is_rejected() {
    let input = pool(64, 2);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    let buffer = fill(&input, &at(&[1]), 0, 0, 0);
    buffer.set_tuple_count(5);
    assert!(matches!(
        handler.process(0, &buffer),
        Err(OperatorError::MalformedBuffer {
            tuples: 5,
            record_size: RECORD_SIZE,
            capacity: 64
        })
    ));
}

#[test]
fn test_timestamp_at_range_end_is_reported() {
    let input = pool(64, 2);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    assert!(matches!(
        handler.process(0, &fill(&input, &at(&[i64::MIN]), 0, 0, 0)),
        Err(OperatorError::Slice(SliceError::TimestampOutOfRange {
            ts: i64::MIN,
            ..
        }))
    ));
}

#[test]
fn test_invalid_worker_is_rejected() {
    let input = pool(1024, 2);
    let handler = window_handler(tumbling(10).num_workers(2).build(), &pool(256, 16));
    assert!(matches!(
        handler.process(2, &fill(&input, &at(&[1]), 0, 0, 0)),
        Err(OperatorError::Slice(SliceError::InvalidWorker { worker: 2, workers: 2 }))
    ));
}

#[test]
fn test_lifecycle_transitions() {
    let input = pool(1024, 4);
    let pages = pool(256, 16);
    let handler =
        WindowOperatorHandler::new(tumbling(10).build(), Arc::new(pages.clone()), time_fn()).unwrap();
    assert_eq!(handler.state(), HandlerState::Created);
    assert!(matches!(
        handler.process(0, &fill(&input, &at(&[1]), 0, 0, 0)),
        Err(OperatorError::InvalidState {
            expected: HandlerState::Running,
            actual: HandlerState::Created
        })
    ));

    handler.start().unwrap();
    assert!(handler.start().is_err());
    assert_eq!(handler.state(), HandlerState::Running);

    handler.stop(QueryTerminationType::Graceful).unwrap();
    assert_eq!(handler.state(), HandlerState::Stopped);
    assert!(matches!(
        handler.process(0, &fill(&input, &at(&[1]), 0, 0, 0)),
        Err(OperatorError::InvalidState {
            actual: HandlerState::Stopped,
            ..
        })
    ));
    assert!(handler.stop(QueryTerminationType::Graceful).unwrap().is_empty());
}

#[test]
fn test_graceful_stop_emits_pending_windows() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    let outputs = handler
        .process(0, &fill(&input, &at(&[1, 15, 25]), 0, 0, 0))
        .unwrap();
    assert!(outputs.is_empty());

    let pending = handler.stop(QueryTerminationType::Graceful).unwrap();
    let windows: Vec<WindowId> = pending.iter().map(WindowTriggerTask::window).collect();
    assert_eq!(
        windows,
        vec![WindowId::new(0, 10), WindowId::new(10, 20), WindowId::new(20, 30)]
    );
    let sequences: Vec<u64> = pending.iter().map(|t| t.metadata().sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(timestamps(&pending[1]), vec![15]);
    assert_eq!(handler.slice_store().num_slices(), 0);
}

#[test]
fn test_hard_stop_discards_state_and_releases_pages() {
    let input = pool(1024, 4);
    let pages = pool(256, 16);
    let handler = window_handler(tumbling(10).build(), &pages);
    handler
        .process(0, &fill(&input, &at(&[1, 15, 25]), 0, 0, 0))
        .unwrap();
    assert!(pages.available_buffers() < 16);

    assert!(handler.stop(QueryTerminationType::HardStop).unwrap().is_empty());
    assert_eq!(handler.slice_store().num_slices(), 0);
    assert_eq!(pages.available_buffers(), 16);
}

#[test]
fn test_output_sequence_starts_at_configured_value() {
    let input = pool(1024, 4);
    let watermark = crate::time::WatermarkConfig::builder()
        .initial_sequence(100)
        .build();
    let handler = window_handler(tumbling(10).watermark(watermark).build(), &pool(256, 16));
    let triggered = tasks(handler.process(0, &fill(&input, &at(&[1]), 0, 100, 10)).unwrap());
    assert_eq!(triggered[0].metadata().sequence_number, 100);
}

#[test]
fn test_restore_watermarks_resumes_sequence() {
    let input = pool(1024, 4);
    let pages = pool(256, 16);
    let first = window_handler(tumbling(10).build(), &pages);
    first.process(0, &fill(&input, &at(&[25]), 0, 0, 20)).unwrap();
    let snapshot = first.watermark_snapshot();

    let mut restored =
        WindowOperatorHandler::new(tumbling(10).build(), Arc::new(pages.clone()), time_fn()).unwrap();
    restored.restore_watermarks(&snapshot).unwrap();
    restored.start().unwrap();
    assert_eq!(restored.current_watermark(), Watermark::new(20));
    assert!(restored.process(0, &fill(&input, &[], 0, 0, 30)).is_err());
    restored.process(0, &fill(&input, &[], 0, 1, 30)).unwrap();
    assert_eq!(restored.current_watermark(), Watermark::new(30));

    assert!(matches!(
        restored.restore_watermarks(&snapshot),
        Err(OperatorError::InvalidState { .. })
    ));
}

#[test]
fn test_join_partitions_cover_every_match() {
    let input = pool(1024, 4);
    let pages = pool(256, 64);
    let config = tumbling(100).num_partitions(4).build();
    let handler = JoinOperatorHandler::new(config, Arc::new(pages), time_fn(), key_hash(), key_eq())
        .unwrap();
    handler.start().unwrap();

    let left: Vec<(i64, u64)> = (0..20).map(|key| (key as i64, key)).collect();
    let right: Vec<(i64, u64)> = (0..20)
        .flat_map(|key| [(50, key), (60, key)])
        .collect();
    let nothing = handler.process(0, JoinSide::Left, &fill(&input, &left, 0, 0, 0)).unwrap();
    assert!(nothing.is_empty());
    let probes = tasks(
        handler
            .process(0, JoinSide::Right, &fill(&input, &right, 0, 1, 100))
            .unwrap(),
    );

    assert_eq!(probes.len(), 4);
    let partitions: Vec<usize> = probes.iter().map(JoinProbeTask::partition).collect();
    assert_eq!(partitions, vec![0, 1, 2, 3]);
    let sequences: Vec<u64> = probes.iter().map(|t| t.metadata().sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);

    let mut matches = 0;
    for probe in &probes {
        assert_eq!(probe.window(), WindowId::new(0, 100));
        assert_eq!(probe.left_records().count(), 5);
        assert_eq!(probe.right_records().count(), 10);
        matches += probe.execute(|l, r| {
            let (_, left_key) = decode(l);
            let (_, right_key) = decode(r);
            assert_eq!(left_key, right_key);
            assert_eq!(left_key % 4, probe.partition() as u64);
        });
    }
    assert_eq!(matches, 40);

    let metrics = handler.metrics();
    assert_eq!(metrics.windows_triggered, 1);
    assert_eq!(metrics.tasks_emitted, 4);
}

#[test]
fn test_join_sides_are_kept_apart() {
    let input = pool(1024, 4);
    let handler = JoinOperatorHandler::new(
        tumbling(10).build(),
        Arc::new(pool(256, 16)),
        time_fn(),
        key_hash(),
        key_eq(),
    )
    .unwrap();
    handler.start().unwrap();
    handler
        .process(0, JoinSide::Left, &fill(&input, &[(1, 1), (2, 2)], 0, 0, 0))
        .unwrap();
    handler
        .process(0, JoinSide::Right, &fill(&input, &[(3, 3)], 0, 1, 0))
        .unwrap();

    let probes = handler.stop(QueryTerminationType::Graceful).unwrap();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].left_records().count(), 2);
    assert_eq!(probes[0].right_records().count(), 1);
    assert_eq!(probes[0].execute(|_, _| {}), 0);
}

#[test]
fn test_join_hash_collisions_do_not_match() {
    let input = pool(1024, 4);
    let handler = JoinOperatorHandler::new(
        tumbling(10).num_partitions(2).build(),
        Arc::new(pool(256, 16)),
        time_fn(),
        Arc::new(|record: &[u8]| decode(record).1 % 4),
        key_eq(),
    )
    .unwrap();
    handler.start().unwrap();
    handler
        .process(0, JoinSide::Left, &fill(&input, &[(1, 1), (2, 5)], 0, 0, 0))
        .unwrap();
    handler
        .process(0, JoinSide::Right, &fill(&input, &[(3, 5), (4, 9)], 0, 1, 0))
        .unwrap();

    let probes = handler.stop(QueryTerminationType::Graceful).unwrap();
    let mut pairs = Vec::new();
    for probe in &probes {
        probe.execute(|l, r| pairs.push((decode(l).1, decode(r).1)));
    }
    assert_eq!(pairs, vec![(5, 5)]);
    let bucket = probes.iter().find(|p| p.partition() == 1).unwrap();
    assert_eq!(bucket.left_records().count(), 2);
    assert_eq!(bucket.right_records().count(), 2);
}

#[test]
fn test_spills_on_page_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let input = pool(1024, 4);
    // Four pages of four records each.
    let pages = pool(64, 4);
    let config = tumbling(10)
        .spill(SpillConfig::enabled(dir.path()))
        .build();
    let handler = window_handler(config, &pages);

    let mut stamps: Vec<i64> = (0..8).collect();
    stamps.extend(10..18);
    stamps.push(20);
    handler.process(0, &fill(&input, &at(&stamps), 0, 0, 0)).unwrap();
    assert_eq!(handler.metrics().records_spilled, 16);

    let first = tasks(handler.process(0, &fill(&input, &[], 0, 1, 10)).unwrap());
    assert_eq!(first.len(), 1);
    assert_eq!(timestamps(&first[0]), (0..8).collect::<Vec<_>>());
    drop(first);

    let rest = handler.stop(QueryTerminationType::Graceful).unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(timestamps(&rest[0]), (10..18).collect::<Vec<_>>());
    assert_eq!(timestamps(&rest[1]), vec![20]);
}

#[test]
fn test_metrics_snapshot_display() {
    let input = pool(1024, 4);
    let handler = window_handler(tumbling(10).build(), &pool(256, 16));
    handler.process(0, &fill(&input, &at(&[1, 2]), 0, 0, 5)).unwrap();

    let metrics = handler.metrics();
    assert_eq!(metrics.live_slices, 1);
    assert_eq!(metrics.watermark, Watermark::new(5));
    let text = metrics.to_string();
    assert!(text.contains("buffers=1"));
    assert!(text.contains("tuples=2"));
    assert!(text.contains("origin-0=5"));
}

#[test]
fn test_config_builder_clamps() {
    let config = OperatorConfig::builder()
        .num_workers(0)
        .num_partitions(1_000_000)
        .build();
    assert_eq!(config.num_workers, 1);
    assert_eq!(config.num_partitions, 4096);
    assert_eq!(config.origins, vec![OriginId(0)]);
    assert!(config.late_data.should_drop());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let pages: Arc<dyn BufferProvider> = Arc::new(pool(64, 4));
    let oversized = tumbling(10).record_size(128).build();
    assert!(matches!(
        WindowOperatorHandler::new(oversized, Arc::clone(&pages), time_fn()),
        Err(OperatorError::InvalidConfig(_))
    ));
    let no_origins = tumbling(10).origins([]).build();
    assert!(matches!(
        WindowOperatorHandler::new(no_origins, Arc::clone(&pages), time_fn()),
        Err(OperatorError::InvalidConfig(_))
    ));
    let bad_window = OperatorConfig::builder()
        .window(WindowType::Sliding { size: 10, slide: 20 })
        .build();
    assert!(matches!(
        WindowOperatorHandler::new(bad_window, pages, time_fn()),
        Err(OperatorError::InvalidConfig(_))
    ));
}

#[test]
fn test_windows_are_unique_per_handler() {
    let input = pool(1024, 4);
    let handler = window_handler(
        OperatorConfig::builder()
            .window(WindowType::Sliding { size: 20, slide: 10 })
            .record_size(RECORD_SIZE)
            .build(),
        &pool(256, 64),
    );
    let mut seen = BTreeSet::new();
    for (sequence, watermark) in [(0u64, 15i64), (1, 15), (2, 30), (3, 45), (4, 60)] {
        let ts = watermark;
        for task in tasks(handler.process(0, &fill(&input, &at(&[ts]), 0, sequence, watermark)).unwrap()) {
            assert!(seen.insert(task.window()), "window {} emitted twice", task.window());
        }
    }
    for task in handler.stop(QueryTerminationType::Graceful).unwrap() {
        assert!(seen.insert(task.window()));
    }
}
