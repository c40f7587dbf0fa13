//! Sliced window aggregation handler.

use std::fmt;
use std::sync::Arc;

use crate::buffer::{Buffer, BufferProvider};
use crate::slice::{CombinedSlice, PagedVector, SliceStore, WindowId};
use crate::time::{Watermark, WatermarkSnapshot};

use super::sliced::{SlicedOperator, TriggeredWindowData};
use super::{
    HandlerState, OperatorConfig, OperatorError, OperatorMetricsSnapshot, Output, OutputVec,
    QueryTerminationType, TaskMetadata, TimeFunction,
};

/// A triggered window ready for aggregation.
#[derive(Debug, Clone)]
pub struct WindowTriggerTask {
    metadata: TaskMetadata,
    window: WindowId,
    slices: Arc<[CombinedSlice]>,
}

impl WindowTriggerTask {
    /// Origin, sequence number and watermark of the task.
    #[must_use]
    pub fn metadata(&self) -> TaskMetadata {
        self.metadata
    }

    /// The triggered window.
    #[must_use]
    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Combined slices of the window, ordered by start.
    #[must_use]
    pub fn slices(&self) -> &[CombinedSlice] {
        &self.slices
    }

    /// Every record of the window, slice by slice.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.slices
            .iter()
            .filter_map(|slice| slice.side(0))
            .flat_map(PagedVector::iter)
    }

    /// Number of records in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.iter().map(CombinedSlice::len).sum()
    }

    /// Whether the window holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds every record of the window into an accumulator.
    pub fn fold<A, F>(&self, init: A, f: F) -> A
    where
        F: FnMut(A, &[u8]) -> A,
    {
        self.records().fold(init, f)
    }
}

/// Operator handler for tumbling and sliding window aggregations.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use streamslice_core::buffer::{BufferPool, BufferPoolConfig, BufferProvider};
/// use streamslice_core::operator::{OperatorConfig, WindowOperatorHandler};
/// use streamslice_core::slice::WindowType;
/// use streamslice_core::time::{SequenceData, Watermark};
///
/// let pool = BufferPool::new(BufferPoolConfig::builder().buffer_size(64).num_buffers(16).build())?;
/// let config = OperatorConfig::builder()
///     .window(WindowType::Tumbling { size: 10 })
///     .record_size(8)
///     .build();
/// let handler = WindowOperatorHandler::new(
///     config,
///     Arc::new(pool.clone()),
///     Arc::new(|record: &[u8]| i64::from_le_bytes(record[..8].try_into().unwrap())),
/// )?;
/// handler.start()?;
///
/// let mut buffer = pool.try_acquire().unwrap();
/// let data = buffer.as_mut_slice().unwrap();
/// for (i, ts) in [1i64, 5, 9, 12, 15].iter().enumerate() {
///     data[i * 8..(i + 1) * 8].copy_from_slice(&ts.to_le_bytes());
/// }
/// buffer.set_tuple_count(5);
/// buffer.set_watermark(Watermark::new(15));
/// buffer.set_sequence_data(SequenceData::new(0));
///
/// let tasks: Vec<_> = handler
///     .process(0, &buffer)?
///     .into_iter()
///     .filter_map(|output| output.into_task())
///     .collect();
/// assert_eq!(tasks.len(), 1);
/// assert_eq!(tasks[0].window().end, 10);
/// assert_eq!(tasks[0].len(), 3);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct WindowOperatorHandler {
    inner: SlicedOperator,
}

impl WindowOperatorHandler {
    /// Creates a handler in the [`HandlerState::Created`] state.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for an unusable window, a
    /// record size that does not fit the provider's pages, or no origins.
    pub fn new(
        config: OperatorConfig,
        provider: Arc<dyn BufferProvider>,
        time_fn: TimeFunction,
    ) -> Result<Self, OperatorError> {
        let inner = SlicedOperator::new("window", &config, 1, 1, provider, time_fn)?;
        Ok(Self { inner })
    }

    /// Replaces the watermark state with a checkpointed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidState`] once the handler was started.
    pub fn restore_watermarks(&mut self, snapshot: &WatermarkSnapshot) -> Result<(), OperatorError> {
        self.inner.restore_watermarks(snapshot)
    }

    /// Starts accepting buffers.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidState`] unless the handler is `Created`.
    pub fn start(&self) -> Result<(), OperatorError> {
        self.inner.start()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.inner.state()
    }

    /// Builds one buffer into the slices and emits a trigger task for every
    /// window the buffer's watermark completes.
    ///
    /// # Errors
    ///
    /// See [`JoinOperatorHandler::process`](super::JoinOperatorHandler::process).
    pub fn process(
        &self,
        worker: usize,
        buffer: &Buffer,
    ) -> Result<OutputVec<WindowTriggerTask>, OperatorError> {
        let processed = self.inner.process(worker, 0, buffer)?;
        let mut outputs = OutputVec::new();
        outputs.extend(processed.late.into_iter().map(Output::LateRecord));
        outputs.extend(processed.triggered.into_iter().filter_map(Self::trigger_task).map(Output::Task));
        Ok(outputs)
    }

    /// Stops the handler.
    ///
    /// A graceful stop emits tasks for every pending window; a hard stop
    /// discards them.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Slice`] if spilled records cannot be read back
    /// while combining.
    pub fn stop(
        &self,
        termination: QueryTerminationType,
    ) -> Result<Vec<WindowTriggerTask>, OperatorError> {
        let triggered = self.inner.stop(termination)?;
        Ok(triggered.into_iter().filter_map(Self::trigger_task).collect())
    }

    fn trigger_task(triggered: TriggeredWindowData) -> Option<WindowTriggerTask> {
        let metadata = triggered.metadata.into_iter().next()?;
        Some(WindowTriggerTask {
            metadata,
            window: triggered.window,
            slices: triggered.slices,
        })
    }

    /// Global watermark over all input origins.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.inner.watermark()
    }

    /// Checkpointable watermark state.
    #[must_use]
    pub fn watermark_snapshot(&self) -> WatermarkSnapshot {
        self.inner.watermark_snapshot()
    }

    /// The slice store backing the handler.
    #[must_use]
    pub fn slice_store(&self) -> &SliceStore {
        self.inner.store()
    }

    /// Point-in-time metrics.
    #[must_use]
    pub fn metrics(&self) -> OperatorMetricsSnapshot {
        self.inner.metrics()
    }
}

impl fmt::Debug for WindowOperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowOperatorHandler")
            .field("state", &self.state())
            .field("watermark", &self.current_watermark())
            .finish_non_exhaustive()
    }
}
