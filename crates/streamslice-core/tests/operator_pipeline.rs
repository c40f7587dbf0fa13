//! Multi-threaded pipelines driving the operator handlers end to end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use streamslice_core::buffer::{Buffer, BufferPool, BufferPoolConfig, BufferProvider};
use streamslice_core::operator::{
    JoinOperatorHandler, JoinProbeTask, JoinSide, KeyEqFunction, KeyHashFunction, OperatorConfig, Output,
    QueryTerminationType, TimeFunction, WindowOperatorHandler, WindowTriggerTask,
};
use streamslice_core::slice::{WindowId, WindowType};
use streamslice_core::time::{OriginId, SequenceData, Watermark};

const RECORD_SIZE: usize = 16;

fn pool(buffer_size: usize, num_buffers: usize) -> BufferPool {
    BufferPool::new(
        BufferPoolConfig::builder()
            .buffer_size(buffer_size)
            .num_buffers(num_buffers)
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

fn encode(input: &BufferPool, records: &[(i64, u64)], origin: u64, sequence: u64) -> Buffer {
    let mut buffer = input.acquire_blocking();
    let data = buffer.as_mut_slice().unwrap();
    for (i, (ts, key)) in records.iter().enumerate() {
        let offset = i * RECORD_SIZE;
        data[offset..offset + 8].copy_from_slice(&ts.to_le_bytes());
        data[offset + 8..offset + 16].copy_from_slice(&key.to_le_bytes());
    }
    buffer.set_tuple_count(records.len() as u64);
    buffer.set_origin(OriginId(origin));
    let first = records.first().map_or(i64::MIN, |(ts, _)| *ts);
    buffer.set_watermark(Watermark::new(first));
    buffer.set_sequence_data(SequenceData::new(sequence));
    buffer
}

/// Two threads per origin, splitting its sequence numbers so that each
/// origin's buffers arrive out of order.
#[test]
fn window_handler_triggers_every_window_once_across_workers() {
    const BUFFERS_PER_ORIGIN: u64 = 100;
    const RECORDS_PER_BUFFER: i64 = 10;

    let config = OperatorConfig::builder()
        .window(WindowType::Tumbling { size: 50 })
        .record_size(RECORD_SIZE)
        .num_workers(4)
        .origins([OriginId(0), OriginId(1)])
        .output_origin(OriginId(7))
        .build();
    let handler = Arc::new(
        WindowOperatorHandler::new(config, Arc::new(pool(4096, 1024)), time_fn()).unwrap(),
    );
    handler.start().unwrap();

    let input = pool(RECORD_SIZE * 10, 16);
    let collected: Arc<Mutex<Vec<WindowTriggerTask>>> = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4usize)
        .map(|worker| {
            let handler = Arc::clone(&handler);
            let input = input.clone();
            let collected = Arc::clone(&collected);
            thread::spawn(move || {
                let origin = (worker / 2) as u64;
                let parity = (worker % 2) as u64;
                for sequence in (parity..BUFFERS_PER_ORIGIN).step_by(2) {
                    let base = sequence as i64 * RECORDS_PER_BUFFER;
                    let records: Vec<(i64, u64)> =
                        (base..base + RECORDS_PER_BUFFER).map(|ts| (ts, origin)).collect();
                    let buffer = encode(&input, &records, origin, sequence);
                    for output in handler.process(worker, &buffer).unwrap() {
                        match output {
                            Output::Task(task) => collected.lock().push(task),
                            Output::LateRecord(late) => panic!("unexpected late record {late:?}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut tasks = std::mem::take(&mut *collected.lock());
    tasks.extend(handler.stop(QueryTerminationType::Graceful).unwrap());

    let mut windows: BTreeMap<WindowId, usize> = BTreeMap::new();
    for task in &tasks {
        assert_eq!(task.metadata().origin, OriginId(7));
        assert!(
            windows.insert(task.window(), task.len()).is_none(),
            "window {} emitted twice",
            task.window()
        );
        for record in task.records() {
            let ts = i64::from_le_bytes(record[..8].try_into().unwrap());
            assert!(task.window().contains(ts));
        }
    }

    let total = (BUFFERS_PER_ORIGIN as i64) * RECORDS_PER_BUFFER;
    assert_eq!(windows.len(), (total / 50) as usize);
    assert!(windows.values().all(|&count| count == 100));

    let mut sequences: Vec<u64> = tasks.iter().map(|t| t.metadata().sequence_number).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (0..tasks.len() as u64).collect::<Vec<_>>());

    let metrics = handler.metrics();
    assert_eq!(metrics.late_records(), 0);
    assert_eq!(metrics.tuples_processed, 2 * total as u64);
    assert_eq!(metrics.live_slices, 0);
}

#[test]
fn join_handler_probes_match_brute_force() {
    const KEYS: u64 = 8;
    const SIZE: i64 = 100;
    const END: i64 = 400;

    let config = OperatorConfig::builder()
        .window(WindowType::Tumbling { size: SIZE })
        .record_size(RECORD_SIZE)
        .num_workers(2)
        .num_partitions(4)
        .origins([OriginId(0), OriginId(1)])
        .build();
    let handler = Arc::new(
        JoinOperatorHandler::new(
            config,
            Arc::new(pool(4096, 256)),
            time_fn(),
            key_hash(),
            key_eq(),
        )
        .unwrap(),
    );
    handler.start().unwrap();

    let input = pool(RECORD_SIZE * 8, 8);
    let collected: Arc<Mutex<Vec<JoinProbeTask>>> = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = [JoinSide::Left, JoinSide::Right]
        .into_iter()
        .enumerate()
        .map(|(worker, side)| {
            let handler = Arc::clone(&handler);
            let input = input.clone();
            let collected = Arc::clone(&collected);
            thread::spawn(move || {
                for (sequence, base) in (0..END).step_by(8).enumerate() {
                    let records: Vec<(i64, u64)> =
                        (base..base + 8).map(|ts| (ts, ts as u64 % KEYS)).collect();
                    let buffer = encode(&input, &records, worker as u64, sequence as u64);
                    let outputs = handler.process(worker, side, &buffer).unwrap();
                    collected
                        .lock()
                        .extend(outputs.into_iter().filter_map(Output::into_task));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut probes = std::mem::take(&mut *collected.lock());
    probes.extend(handler.stop(QueryTerminationType::Graceful).unwrap());
    assert_eq!(probes.len(), (END / SIZE) as usize * 4);

    let mut matches: BTreeMap<WindowId, usize> = BTreeMap::new();
    for probe in &probes {
        *matches.entry(probe.window()).or_default() += probe.execute(|_, _| {});
    }

    for (window, found) in matches {
        let mut per_key = [0usize; KEYS as usize];
        for ts in window.start..window.end {
            per_key[(ts as u64 % KEYS) as usize] += 1;
        }
        let expected: usize = per_key.iter().map(|n| n * n).sum();
        assert_eq!(found, expected, "window {window}");
    }
}

#[test]
fn buffers_return_to_pool_after_hard_stop() {
    let pages = pool(256, 32);
    let config = OperatorConfig::builder()
        .window(WindowType::Sliding { size: 20, slide: 5 })
        .record_size(RECORD_SIZE)
        .build();
    let handler = WindowOperatorHandler::new(config, Arc::new(pages.clone()), time_fn()).unwrap();
    handler.start().unwrap();

    let input = pool(1024, 2);
    let records: Vec<(i64, u64)> = (0..40).map(|ts| (ts, 0)).collect();
    let buffer = encode(&input, &records, 0, 0);
    handler.process(0, &buffer).unwrap();
    drop(buffer);
    assert!(pages.available_buffers() < 32);

    assert!(handler.stop(QueryTerminationType::HardStop).unwrap().is_empty());
    assert_eq!(pages.available_buffers(), 32);
    assert_eq!(input.available_buffers(), 2);
}
