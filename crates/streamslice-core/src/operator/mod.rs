//! # Operator Module
//!
//! Operator handlers that tie a [`SliceStore`](crate::slice::SliceStore) to a
//! [`MultiOriginWatermarkProcessor`](crate::time::MultiOriginWatermarkProcessor).
//!
//! ## Build / Trigger Cycle
//!
//! ```text
//!  worker k, buffer b                               trigger (serialized)
//!  ───────────────────                              ────────────────────
//!  for record in b:                                 windows = collect((last, wm])
//!    ts = time_fn(record)                           for window in windows:
//!    ts < wm ? late : slice(ts).append(k, side)       combine its slices
//!  wm = watermarks.update(origin(b), seq(b))          emit task(s) tagged with
//!  wm > last ? trigger(wm) ───────────────────────►   origin, seq, watermark
//!                                                   remove_expired(wm)
//! ```
//!
//! The trigger step is the only point where build and probe meet; tasks only
//! ever read combined slices.
//!
//! - [`JoinOperatorHandler`]: two build sides, one probe task per hash partition
//! - [`WindowOperatorHandler`]: one build side, one trigger task per window

mod sliced;
pub mod join;
pub mod window;

pub use join::{JoinOperatorHandler, JoinProbeTask, JoinSide};
pub use window::{WindowOperatorHandler, WindowTriggerTask};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::slice::{SliceError, SpillConfig, WindowType};
use crate::time::{OriginId, Watermark, WatermarkConfig, WatermarkError};

/// Extracts the event timestamp of a record.
pub type TimeFunction = Arc<dyn Fn(&[u8]) -> i64 + Send + Sync>;

/// Computes the join-key hash of a record.
pub type KeyHashFunction = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

/// Whether a left and a right record carry the same join key.
pub type KeyEqFunction = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Output collection type.
///
/// Most buffers trigger nothing or a single window.
pub type OutputVec<T> = SmallVec<[Output<T>; 4]>;

/// Something an operator hands downstream.
#[derive(Debug, Clone)]
pub enum Output<T> {
    /// A task reading combined slices.
    Task(T),
    /// A late record routed to the configured side output.
    LateRecord(LateRecord),
}

impl<T> Output<T> {
    /// Returns the task, if this output is one.
    #[must_use]
    pub fn into_task(self) -> Option<T> {
        match self {
            Output::Task(task) => Some(task),
            Output::LateRecord(_) => None,
        }
    }
}

/// A record that arrived behind the watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateRecord {
    /// Side output name.
    pub side_output: Arc<str>,
    /// Build side the record was destined for.
    pub side: usize,
    /// Event timestamp of the record.
    pub timestamp: i64,
    /// Watermark the record was behind.
    pub watermark: Watermark,
    /// The record bytes.
    pub record: Vec<u8>,
}

/// Tags carried by every emitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMetadata {
    /// Origin id of the operator's output stream.
    pub origin: OriginId,
    /// Sequence number within the output stream, strictly increasing.
    pub sequence_number: u64,
    /// Global watermark when the task was emitted.
    pub watermark: Watermark,
}

/// How an operator is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTerminationType {
    /// Trigger every pending window before stopping.
    Graceful,
    /// Discard pending state.
    HardStop,
}

/// Lifecycle of an operator handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Built but not started.
    Created,
    /// Accepting buffers.
    Running,
    /// Torn down; no more buffers are accepted.
    Stopped,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerState::Created => "created",
            HandlerState::Running => "running",
            HandlerState::Stopped => "stopped",
        })
    }
}

/// Configuration for late data handling.
///
/// A record is late when its timestamp is below the watermark the handler
/// observed when processing it. Late records never reach a slice.
///
/// # Example
///
/// ```rust
/// use streamslice_core::operator::LateDataConfig;
///
/// let config = LateDataConfig::with_side_output("late");
/// assert_eq!(config.side_output(), Some("late"));
/// assert!(LateDataConfig::drop().should_drop());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LateDataConfig {
    side_output: Option<Arc<str>>,
}

impl LateDataConfig {
    /// Drops late records (default behavior).
    #[must_use]
    pub fn drop() -> Self {
        Self { side_output: None }
    }

    /// Routes late records to a named side output.
    #[must_use]
    pub fn with_side_output(name: impl Into<Arc<str>>) -> Self {
        Self {
            side_output: Some(name.into()),
        }
    }

    /// Returns the side output name, if configured.
    #[must_use]
    pub fn side_output(&self) -> Option<&str> {
        self.side_output.as_deref()
    }

    /// Returns true if late records are dropped.
    #[must_use]
    pub fn should_drop(&self) -> bool {
        self.side_output.is_none()
    }
}

/// Configuration shared by the operator handlers.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Window shape.
    pub window: WindowType,
    /// Worker threads that call `process`.
    pub num_workers: usize,
    /// Hash partitions per triggered join window.
    pub num_partitions: usize,
    /// Size of one record in bytes.
    pub record_size: usize,
    /// Input origins feeding the operator.
    pub origins: Vec<OriginId>,
    /// Origin id stamped on emitted tasks.
    pub output_origin: OriginId,
    /// Watermark log configuration, applied per origin.
    pub watermark: WatermarkConfig,
    /// Late data handling.
    pub late_data: LateDataConfig,
    /// Spilling on page exhaustion.
    pub spill: SpillConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            window: WindowType::Tumbling { size: 1000 },
            num_workers: 1,
            num_partitions: 1,
            record_size: 16,
            origins: vec![OriginId(0)],
            output_origin: OriginId(0),
            watermark: WatermarkConfig::default(),
            late_data: LateDataConfig::default(),
            spill: SpillConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> OperatorConfigBuilder {
        OperatorConfigBuilder::default()
    }
}

/// Builder for [`OperatorConfig`].
#[derive(Debug, Default)]
pub struct OperatorConfigBuilder {
    window: Option<WindowType>,
    num_workers: Option<usize>,
    num_partitions: Option<usize>,
    record_size: Option<usize>,
    origins: Option<Vec<OriginId>>,
    output_origin: Option<OriginId>,
    watermark: Option<WatermarkConfig>,
    late_data: Option<LateDataConfig>,
    spill: Option<SpillConfig>,
}

impl OperatorConfigBuilder {
    /// Sets the window shape.
    #[must_use]
    pub fn window(mut self, window: WindowType) -> Self {
        self.window = Some(window);
        self
    }

    /// Sets the number of worker threads (clamped to `1..=1024`).
    #[must_use]
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.num_workers = Some(workers.clamp(1, 1024));
        self
    }

    /// Sets the number of join hash partitions (clamped to `1..=4096`).
    #[must_use]
    pub fn num_partitions(mut self, partitions: usize) -> Self {
        self.num_partitions = Some(partitions.clamp(1, 4096));
        self
    }

    /// Sets the record size in bytes.
    #[must_use]
    pub fn record_size(mut self, size: usize) -> Self {
        self.record_size = Some(size);
        self
    }

    /// Sets the input origins.
    #[must_use]
    pub fn origins(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        self.origins = Some(origins.into_iter().collect());
        self
    }

    /// Sets the origin stamped on emitted tasks.
    #[must_use]
    pub fn output_origin(mut self, origin: OriginId) -> Self {
        self.output_origin = Some(origin);
        self
    }

    /// Sets the watermark log configuration.
    #[must_use]
    pub fn watermark(mut self, config: WatermarkConfig) -> Self {
        self.watermark = Some(config);
        self
    }

    /// Sets late data handling.
    #[must_use]
    pub fn late_data(mut self, config: LateDataConfig) -> Self {
        self.late_data = Some(config);
        self
    }

    /// Sets spilling.
    #[must_use]
    pub fn spill(mut self, config: SpillConfig) -> Self {
        self.spill = Some(config);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> OperatorConfig {
        let defaults = OperatorConfig::default();
        OperatorConfig {
            window: self.window.unwrap_or(defaults.window),
            num_workers: self.num_workers.unwrap_or(defaults.num_workers),
            num_partitions: self.num_partitions.unwrap_or(defaults.num_partitions),
            record_size: self.record_size.unwrap_or(defaults.record_size),
            origins: self.origins.unwrap_or(defaults.origins),
            output_origin: self.output_origin.unwrap_or(defaults.output_origin),
            watermark: self.watermark.unwrap_or(defaults.watermark),
            late_data: self.late_data.unwrap_or(defaults.late_data),
            spill: self.spill.unwrap_or(defaults.spill),
        }
    }
}

/// Errors from operator handlers.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// The configuration cannot be used.
    #[error("invalid operator configuration: {0}")]
    InvalidConfig(String),

    /// The handler is not in the state the call requires.
    #[error("operator is {actual}, expected {expected}")]
    InvalidState {
        /// State the call requires.
        expected: HandlerState,
        /// Current state.
        actual: HandlerState,
    },

    /// A buffer claims more tuples than it can hold.
    #[error("buffer holds {tuples} tuples of {record_size} bytes but has capacity {capacity}")]
    MalformedBuffer {
        /// Claimed tuple count.
        tuples: u64,
        /// Configured record size.
        record_size: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// Watermark protocol violation.
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Slice protocol violation or spill failure.
    #[error("slice error: {0}")]
    Slice(#[from] SliceError),
}

/// Counters updated by an operator handler; read through
/// [`OperatorMetricsSnapshot`].
#[derive(Debug, Default)]
pub(crate) struct OperatorMetrics {
    buffers_processed: AtomicU64,
    tuples_processed: AtomicU64,
    late_dropped: AtomicU64,
    late_side_output: AtomicU64,
    windows_triggered: AtomicU64,
    tasks_emitted: AtomicU64,
    records_spilled: AtomicU64,
}

impl OperatorMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one processed buffer holding `tuples` records.
    pub fn record_buffer(&self, tuples: u64) {
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
        self.tuples_processed.fetch_add(tuples, Ordering::Relaxed);
    }

    /// Records a dropped late record.
    pub fn record_late_dropped(&self) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a late record routed to the side output.
    pub fn record_late_side_output(&self) {
        self.late_side_output.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a triggered window and the tasks emitted for it.
    pub fn record_trigger(&self, tasks: u64) {
        self.windows_triggered.fetch_add(1, Ordering::Relaxed);
        self.tasks_emitted.fetch_add(tasks, Ordering::Relaxed);
    }

    /// Records spilled records.
    pub fn record_spilled(&self, records: u64) {
        self.records_spilled.fetch_add(records, Ordering::Relaxed);
    }
}

/// Point-in-time view of an operator's counters and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorMetricsSnapshot {
    /// Buffers processed.
    pub buffers_processed: u64,
    /// Tuples processed, late ones included.
    pub tuples_processed: u64,
    /// Late records dropped.
    pub late_records_dropped: u64,
    /// Late records routed to the side output.
    pub late_records_side_output: u64,
    /// Windows triggered.
    pub windows_triggered: u64,
    /// Tasks emitted.
    pub tasks_emitted: u64,
    /// Records written to spill files.
    pub records_spilled: u64,
    /// Live slices in the store.
    pub live_slices: usize,
    /// Windows tracked by the store.
    pub live_windows: usize,
    /// Global watermark.
    pub watermark: Watermark,
    /// Watermark of every input origin.
    pub origin_watermarks: Vec<(OriginId, Watermark)>,
}

impl OperatorMetricsSnapshot {
    /// Late records, dropped or routed.
    #[must_use]
    pub fn late_records(&self) -> u64 {
        self.late_records_dropped + self.late_records_side_output
    }
}

impl fmt::Display for OperatorMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffers={} tuples={} late={} (dropped={}, side_output={}) windows={} tasks={} \
             spilled={} live_slices={} live_windows={} watermark={}",
            self.buffers_processed,
            self.tuples_processed,
            self.late_records(),
            self.late_records_dropped,
            self.late_records_side_output,
            self.windows_triggered,
            self.tasks_emitted,
            self.records_spilled,
            self.live_slices,
            self.live_windows,
            self.watermark
        )?;
        for (origin, watermark) in &self.origin_watermarks {
            write!(f, " {origin}={watermark}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
