//! Synthetic workload driving a window handler and a join handler from
//! worker threads.
//!
//! Every origin produces `buffers_per_origin` buffers of consecutive
//! timestamps. The workers serving one origin split its sequence numbers
//! round-robin, so each origin's buffers reach the handlers out of order.
//! Even sequence numbers feed the left side of the join and odd ones the right.

use std::fmt;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Result};
use streamslice_core::buffer::{Buffer, BufferPool, BufferPoolConfig, BufferPoolStats, BufferProvider};
use streamslice_core::operator::{
    JoinOperatorHandler, JoinProbeTask, JoinSide, KeyEqFunction, KeyHashFunction, OperatorMetricsSnapshot,
    Output, OutputVec, QueryTerminationType, TimeFunction, WindowOperatorHandler,
    WindowTriggerTask,
};
use streamslice_core::time::{OriginId, SequenceData, Watermark};
use tracing::{debug, info};

use crate::config::{ServerConfig, RECORD_SIZE};

/// Counters accumulated by the workers and the final stop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub windows: u64,
    pub window_records: u64,
    pub key_sum: u64,
    pub probes: u64,
    pub join_matches: u64,
    pub late_records: u64,
}

impl Totals {
    fn merge(&mut self, other: Totals) {
        self.windows += other.windows;
        self.window_records += other.window_records;
        self.key_sum = self.key_sum.wrapping_add(other.key_sum);
        self.probes += other.probes;
        self.join_matches += other.join_matches;
        self.late_records += other.late_records;
    }

    fn aggregate(&mut self, task: &WindowTriggerTask) {
        self.windows += 1;
        self.window_records += task.len() as u64;
        self.key_sum = task.fold(self.key_sum, |sum, record| sum.wrapping_add(read_u64(record, 8)));
    }

    fn probe(&mut self, task: &JoinProbeTask) {
        self.probes += 1;
        self.join_matches += task.execute(|_, _| {}) as u64;
    }

    fn window_outputs(&mut self, outputs: OutputVec<WindowTriggerTask>) {
        for output in outputs {
            match output {
                Output::Task(task) => self.aggregate(&task),
                Output::LateRecord(_) => self.late_records += 1,
            }
        }
    }

    fn join_outputs(&mut self, outputs: OutputVec<JoinProbeTask>) {
        for output in outputs {
            match output {
                Output::Task(task) => self.probe(&task),
                Output::LateRecord(_) => self.late_records += 1,
            }
        }
    }
}

/// Outcome of a workload run.
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub totals: Totals,
    pub window: OperatorMetricsSnapshot,
    pub join: OperatorMetricsSnapshot,
    pub pool: BufferPoolStats,
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "windows={} records={} probes={} matches={} late_side_output={}",
            self.totals.windows,
            self.totals.window_records,
            self.totals.probes,
            self.totals.join_matches,
            self.totals.late_records
        )?;
        writeln!(f, "window: {}", self.window)?;
        writeln!(f, "join: {}", self.join)?;
        write!(f, "{}", self.pool)
    }
}

/// Which sequence numbers of which origin a worker produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Assignment {
    origin: u64,
    first: u64,
    stride: usize,
}

fn assignments(workers: usize, origins: usize) -> Result<Vec<Assignment>> {
    if origins == 0 {
        bail!("workload needs at least one origin");
    }
    if workers < origins {
        bail!("workload needs at least one worker per origin ({workers} workers, {origins} origins)");
    }
    Ok((0..workers)
        .map(|worker| {
            let origin = worker % origins;
            Assignment {
                origin: origin as u64,
                first: (worker / origins) as u64,
                stride: (workers - origin).div_ceil(origins),
            }
        })
        .collect())
}

fn read_u64(record: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[allow(clippy::cast_possible_wrap)]
fn time_function() -> TimeFunction {
    Arc::new(|record: &[u8]| read_u64(record, 0) as i64)
}

fn key_hash_function() -> KeyHashFunction {
    Arc::new(|record: &[u8]| read_u64(record, 8))
}

fn key_eq_function() -> KeyEqFunction {
    Arc::new(|left: &[u8], right: &[u8]| left[8..RECORD_SIZE] == right[8..RECORD_SIZE])
}

struct Generator<'a> {
    input: &'a BufferPool,
    records_per_buffer: usize,
    keys: u64,
    late_every: usize,
    late_offset: i64,
    initial_sequence: u64,
}

impl Generator<'_> {
    #[allow(
        clippy::cast_possible_wrap,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn buffer(&self, origin: u64, sequence: u64) -> Result<Buffer> {
        let mut buffer = self.input.acquire_blocking();
        let Some(data) = buffer.as_mut_slice() else {
            bail!("acquired input buffer is shared");
        };

        let base = (sequence * self.records_per_buffer as u64) as i64;
        for (i, record) in data
            .chunks_exact_mut(RECORD_SIZE)
            .take(self.records_per_buffer)
            .enumerate()
        {
            let mut ts = base + i as i64;
            let key = (ts as u64).wrapping_mul(31).wrapping_add(origin) % self.keys;
            if self.late_every > 0 && (ts as usize) % self.late_every == self.late_every - 1 {
                ts -= self.late_offset;
            }
            record[..8].copy_from_slice(&ts.to_le_bytes());
            record[8..].copy_from_slice(&key.to_le_bytes());
        }

        buffer.set_tuple_count(self.records_per_buffer as u64);
        buffer.set_origin(OriginId(origin));
        buffer.set_watermark(Watermark::new(base));
        buffer.set_sequence_data(SequenceData::new(self.initial_sequence + sequence));
        Ok(buffer)
    }
}

fn run_worker(
    worker: usize,
    assignment: Assignment,
    buffers_per_origin: u64,
    generator: &Generator<'_>,
    window: &WindowOperatorHandler,
    join: &JoinOperatorHandler,
) -> Result<Totals> {
    let mut totals = Totals::default();
    for sequence in (assignment.first..buffers_per_origin).step_by(assignment.stride) {
        let buffer = generator.buffer(assignment.origin, sequence)?;
        totals.window_outputs(window.process(worker, &buffer)?);
        let side = if sequence % 2 == 0 {
            JoinSide::Left
        } else {
            JoinSide::Right
        };
        totals.join_outputs(join.process(worker, side, &buffer)?);
    }
    debug!(worker, origin = assignment.origin, ?totals, "worker finished");
    Ok(totals)
}

/// Runs the workload described by `config` to completion and stops both
/// handlers gracefully.
pub fn run(config: &ServerConfig) -> Result<WorkloadReport> {
    let workload = &config.workload;
    let plan = assignments(workload.workers, workload.origins)?;
    let records_per_buffer = workload.records_per_buffer.max(1);

    let pages = BufferPool::new(config.pool_config())?;
    let input = BufferPool::new(
        BufferPoolConfig::builder()
            .buffer_size(records_per_buffer * RECORD_SIZE)
            .num_buffers(workload.workers * 2)
            .build(),
    )?;

    let operator_config = config.operator_config();
    let window = WindowOperatorHandler::new(
        operator_config.clone(),
        Arc::new(pages.clone()),
        time_function(),
    )?;
    let join = JoinOperatorHandler::new(
        operator_config,
        Arc::new(pages.clone()),
        time_function(),
        key_hash_function(),
        key_eq_function(),
    )?;
    window.start()?;
    join.start()?;

    let generator = Generator {
        input: &input,
        records_per_buffer,
        keys: workload.keys.max(1),
        late_every: workload.late_every,
        late_offset: config.window_type().size() * 2,
        initial_sequence: config.watermark.initial_sequence,
    };
    info!(
        workers = workload.workers,
        origins = workload.origins,
        buffers_per_origin = workload.buffers_per_origin,
        records_per_buffer,
        window = ?config.window_type(),
        "running workload"
    );

    let results: Vec<Result<Totals>> = thread::scope(|scope| {
        let handles: Vec<_> = plan
            .iter()
            .enumerate()
            .map(|(worker, &assignment)| {
                let (generator, window, join) = (&generator, &window, &join);
                scope.spawn(move || {
                    run_worker(
                        worker,
                        assignment,
                        workload.buffers_per_origin,
                        generator,
                        window,
                        join,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("worker {worker} panicked")))
            })
            .collect()
    });

    let mut totals = Totals::default();
    for result in results {
        totals.merge(result?);
    }
    for task in window.stop(QueryTerminationType::Graceful)? {
        totals.aggregate(&task);
    }
    for task in join.stop(QueryTerminationType::Graceful)? {
        totals.probe(&task);
    }

    let report = WorkloadReport {
        totals,
        window: window.metrics(),
        join: join.metrics(),
        pool: pages.stats(),
    };
    info!(
        windows = totals.windows,
        records = totals.window_records,
        matches = totals.join_matches,
        "workload finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WindowKind, WindowSection, WorkloadSection};

    fn small_config(workers: usize, origins: usize) -> ServerConfig {
        ServerConfig {
            window: WindowSection {
                kind: WindowKind::Tumbling,
                size: 16,
                slide: None,
            },
            workload: WorkloadSection {
                workers,
                origins,
                buffers_per_origin: 20,
                records_per_buffer: 8,
                keys: 4,
                late_every: 0,
            },
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_assignments_cover_every_sequence() {
        let plan = assignments(5, 2).unwrap();
        for origin in 0..2u64 {
            let mut sequences: Vec<u64> = plan
                .iter()
                .filter(|a| a.origin == origin)
                .flat_map(|a| (a.first..30).step_by(a.stride))
                .collect();
            sequences.sort_unstable();
            assert_eq!(sequences, (0..30).collect::<Vec<_>>());
        }
        assert!(assignments(1, 2).is_err());
        assert!(assignments(1, 0).is_err());
    }

    #[test]
    fn test_run_single_origin() {
        let report = run(&small_config(2, 1)).unwrap();
        let totals = report.totals;
        assert_eq!(totals.windows, 10);
        assert_eq!(totals.window_records, 160);
        assert_eq!(totals.late_records, 0);
        assert_eq!(totals.probes, 10);
        assert_eq!(totals.join_matches, 160);
        assert_eq!(report.window.late_records(), 0);
        assert_eq!(report.pool.in_use(), 0);
    }

    #[test]
    fn test_run_two_origins_counts_every_record() {
        let report = run(&small_config(4, 2)).unwrap();
        assert_eq!(report.totals.window_records, 320);
        assert_eq!(report.window.tuples_processed, 320);
        assert!(report.to_string().contains("windows="));
    }

    #[test]
    fn test_late_records_are_routed() {
        let mut config = small_config(1, 1);
        config.workload.late_every = 5;
        config.operator.late_side_output = Some("late".to_string());
        let report = run(&config).unwrap();
        let totals = report.totals;
        assert_eq!(
            totals.window_records + report.window.late_records(),
            160
        );
        assert_eq!(
            totals.late_records,
            report.window.late_records_side_output + report.join.late_records_side_output
        );
    }
}
