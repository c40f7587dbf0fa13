//! Build and trigger logic shared by the sliced operator handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, error, info};

use crate::buffer::{Buffer, BufferProvider};
use crate::slice::{
    CombinedSlice, Slice, SliceError, SliceStore, SliceStoreConfig, SpillConfig, TriggeredWindow,
    WindowId,
};
use crate::time::{MultiOriginWatermarkProcessor, OriginId, Watermark, WatermarkConfig, WatermarkSnapshot};

use super::{
    HandlerState, LateDataConfig, LateRecord, OperatorConfig, OperatorError, OperatorMetrics,
    OperatorMetricsSnapshot, QueryTerminationType, TaskMetadata, TimeFunction,
};

/// A window that has been triggered and combined.
pub(crate) struct TriggeredWindowData {
    pub(crate) window: WindowId,
    pub(crate) slices: Arc<[CombinedSlice]>,
    /// One entry per task to emit for the window.
    pub(crate) metadata: SmallVec<[TaskMetadata; 4]>,
}

/// What processing one buffer produced.
pub(crate) struct Processed {
    pub(crate) late: SmallVec<[LateRecord; 2]>,
    pub(crate) triggered: Vec<TriggeredWindowData>,
}

pub(crate) struct SlicedOperator {
    name: &'static str,
    record_size: usize,
    tasks_per_window: usize,
    store: SliceStore,
    watermarks: MultiOriginWatermarkProcessor,
    watermark_config: WatermarkConfig,
    time_fn: TimeFunction,
    late_data: LateDataConfig,
    spill: SpillConfig,
    output_origin: OriginId,
    output_sequence: AtomicU64,
    last_triggered: Mutex<i64>,
    lifecycle: RwLock<HandlerState>,
    metrics: OperatorMetrics,
}

impl SlicedOperator {
    pub(crate) fn new(
        name: &'static str,
        config: &OperatorConfig,
        num_sides: usize,
        tasks_per_window: usize,
        provider: Arc<dyn BufferProvider>,
        time_fn: TimeFunction,
    ) -> Result<Self, OperatorError> {
        if config.origins.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "at least one input origin is required".to_string(),
            ));
        }
        let store = SliceStore::new(
            SliceStoreConfig {
                window: config.window,
                num_workers: config.num_workers,
                num_sides,
                record_size: config.record_size,
            },
            provider,
        )
        .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            name,
            record_size: config.record_size,
            tasks_per_window: tasks_per_window.max(1),
            store,
            watermarks: MultiOriginWatermarkProcessor::new(
                config.origins.iter().copied(),
                config.watermark,
            ),
            watermark_config: config.watermark,
            time_fn,
            late_data: config.late_data.clone(),
            spill: config.spill.clone(),
            output_origin: config.output_origin,
            output_sequence: AtomicU64::new(config.watermark.initial_sequence),
            last_triggered: Mutex::new(i64::MIN),
            lifecycle: RwLock::new(HandlerState::Created),
            metrics: OperatorMetrics::new(),
        })
    }

    pub(crate) fn restore_watermarks(&mut self, snapshot: &WatermarkSnapshot) -> Result<(), OperatorError> {
        let state = *self.lifecycle.get_mut();
        if state != HandlerState::Created {
            return Err(OperatorError::InvalidState {
                expected: HandlerState::Created,
                actual: state,
            });
        }
        self.watermarks = MultiOriginWatermarkProcessor::restore(snapshot, self.watermark_config);
        info!(
            operator = self.name,
            watermark = %self.watermarks.current_watermark(),
            "restored watermark state"
        );
        Ok(())
    }

    pub(crate) fn start(&self) -> Result<(), OperatorError> {
        let mut state = self.lifecycle.write();
        if *state != HandlerState::Created {
            return Err(OperatorError::InvalidState {
                expected: HandlerState::Created,
                actual: *state,
            });
        }
        *state = HandlerState::Running;
        info!(operator = self.name, "operator started");
        Ok(())
    }

    pub(crate) fn state(&self) -> HandlerState {
        *self.lifecycle.read()
    }

    pub(crate) fn process(
        &self,
        worker: usize,
        side: usize,
        buffer: &Buffer,
    ) -> Result<Processed, OperatorError> {
        let state = self.lifecycle.read();
        if *state != HandlerState::Running {
            return Err(OperatorError::InvalidState {
                expected: HandlerState::Running,
                actual: *state,
            });
        }

        let tuples = buffer.tuple_count();
        let bytes = usize::try_from(tuples)
            .ok()
            .and_then(|t| t.checked_mul(self.record_size))
            .filter(|&bytes| bytes <= buffer.capacity())
            .ok_or(OperatorError::MalformedBuffer {
                tuples,
                record_size: self.record_size,
                capacity: buffer.capacity(),
            })?;

        let watermark = self.watermarks.current_watermark();
        let mut late = SmallVec::new();
        let mut current: Option<Arc<Slice>> = None;
        for record in buffer.as_slice()[..bytes].chunks_exact(self.record_size) {
            let ts = (self.time_fn)(record);
            if watermark.is_late(ts) {
                self.route_late(&mut late, side, ts, watermark, record);
                continue;
            }
            if let Err(e) = self.append_record(&mut current, worker, side, ts, record) {
                // A concurrent trigger may have closed the slice after we read
                // the watermark; the record is late, not a violation.
                let now = self.watermarks.current_watermark();
                if is_closed_slice(&e) && now.is_late(ts) {
                    self.route_late(&mut late, side, ts, now, record);
                    continue;
                }
                error!(operator = self.name, worker, side, ts, error = %e, "failed to append record");
                return Err(e.into());
            }
        }
        self.metrics.record_buffer(tuples);
        if !late.is_empty() {
            debug!(operator = self.name, late = late.len(), "routed late records");
        }

        let origin = buffer.origin();
        let sequence = buffer.sequence_data();
        let global = self
            .watermarks
            .update(origin, buffer.watermark(), sequence)
            .inspect_err(|e| {
                error!(operator = self.name, %origin, %sequence, error = %e, "watermark protocol violation");
            })?;
        let triggered = self.trigger(global)?;
        Ok(Processed { late, triggered })
    }

    fn append_record(
        &self,
        current: &mut Option<Arc<Slice>>,
        worker: usize,
        side: usize,
        ts: i64,
        record: &[u8],
    ) -> Result<(), SliceError> {
        let slice = match current.take() {
            Some(slice) if slice.contains(ts) => slice,
            _ => self.store.get_or_create_slice(ts)?,
        };
        let result = self.append(&slice, worker, side, record);
        *current = Some(slice);
        result
    }

    fn append(&self, slice: &Slice, worker: usize, side: usize, record: &[u8]) -> Result<(), SliceError> {
        if !self.spill.enabled {
            return slice.append(worker, side, record);
        }
        match slice.try_append(worker, side, record) {
            Err(SliceError::PagesExhausted) => {
                let spilled = self.store.spill_worker(worker, &self.spill.directory)?;
                self.metrics.record_spilled(spilled as u64);
                debug!(operator = self.name, worker, spilled, "spilled partitions on page exhaustion");
                slice.append(worker, side, record)
            }
            result => result,
        }
    }

    fn route_late(
        &self,
        late: &mut SmallVec<[LateRecord; 2]>,
        side: usize,
        ts: i64,
        watermark: Watermark,
        record: &[u8],
    ) {
        match &self.late_data.side_output {
            None => self.metrics.record_late_dropped(),
            Some(name) => {
                self.metrics.record_late_side_output();
                late.push(LateRecord {
                    side_output: Arc::clone(name),
                    side,
                    timestamp: ts,
                    watermark,
                    record: record.to_vec(),
                });
            }
        }
    }

    fn trigger(&self, watermark: Watermark) -> Result<Vec<TriggeredWindowData>, OperatorError> {
        let mut last = self.last_triggered.lock();
        let current = watermark.timestamp();
        if current <= *last {
            return Ok(Vec::new());
        }
        let previous = std::mem::replace(&mut *last, current);
        let windows = self.store.collect_windows_to_trigger(previous, current);
        let triggered = self.combine_windows(windows, watermark)?;
        self.store.remove_expired(current);
        Ok(triggered)
    }

    fn combine_windows(
        &self,
        windows: Vec<TriggeredWindow>,
        watermark: Watermark,
    ) -> Result<Vec<TriggeredWindowData>, OperatorError> {
        windows
            .into_iter()
            .map(|triggered| {
                let slices = triggered
                    .slices
                    .iter()
                    .map(|slice| slice.combine())
                    .collect::<Result<Arc<[CombinedSlice]>, _>>()?;
                let metadata = (0..self.tasks_per_window)
                    .map(|_| TaskMetadata {
                        origin: self.output_origin,
                        sequence_number: self.output_sequence.fetch_add(1, Ordering::Relaxed),
                        watermark,
                    })
                    .collect();
                self.metrics.record_trigger(self.tasks_per_window as u64);
                debug!(
                    operator = self.name,
                    window = %triggered.window,
                    slices = slices.len(),
                    %watermark,
                    "triggered window"
                );
                Ok(TriggeredWindowData {
                    window: triggered.window,
                    slices,
                    metadata,
                })
            })
            .collect()
    }

    pub(crate) fn stop(
        &self,
        termination: QueryTerminationType,
    ) -> Result<Vec<TriggeredWindowData>, OperatorError> {
        let mut state = self.lifecycle.write();
        if *state == HandlerState::Stopped {
            return Ok(Vec::new());
        }
        *state = HandlerState::Stopped;

        let triggered = match termination {
            QueryTerminationType::Graceful => {
                let windows = self.store.trigger_all_windows();
                self.combine_windows(windows, self.watermarks.current_watermark())?
            }
            QueryTerminationType::HardStop => Vec::new(),
        };
        let discarded = self.store.clear();
        info!(
            operator = self.name,
            ?termination,
            windows = triggered.len(),
            slices = discarded,
            "operator stopped"
        );
        Ok(triggered)
    }

    pub(crate) fn watermark(&self) -> Watermark {
        self.watermarks.current_watermark()
    }

    pub(crate) fn watermark_snapshot(&self) -> WatermarkSnapshot {
        self.watermarks.snapshot()
    }

    pub(crate) fn store(&self) -> &SliceStore {
        &self.store
    }

    pub(crate) fn metrics(&self) -> OperatorMetricsSnapshot {
        let m = &self.metrics;
        OperatorMetricsSnapshot {
            buffers_processed: m.buffers_processed.load(Ordering::Relaxed),
            tuples_processed: m.tuples_processed.load(Ordering::Relaxed),
            late_records_dropped: m.late_dropped.load(Ordering::Relaxed),
            late_records_side_output: m.late_side_output.load(Ordering::Relaxed),
            windows_triggered: m.windows_triggered.load(Ordering::Relaxed),
            tasks_emitted: m.tasks_emitted.load(Ordering::Relaxed),
            records_spilled: m.records_spilled.load(Ordering::Relaxed),
            live_slices: self.store.num_slices(),
            live_windows: self.store.num_windows(),
            watermark: self.watermarks.current_watermark(),
            origin_watermarks: self.watermarks.origin_watermarks(),
        }
    }
}

/// Errors raised when a record targets a slice that was already closed.
fn is_closed_slice(error: &SliceError) -> bool {
    matches!(
        error,
        SliceError::AlreadyCombined { .. }
            | SliceError::Retired { .. }
            | SliceError::SliceExpired { .. }
            | SliceError::WindowAlreadyTriggered { .. }
    )
}
