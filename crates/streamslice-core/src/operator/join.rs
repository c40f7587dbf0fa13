//! # Sliced Window Join
//!
//! Both inputs are built into the same slices, one build side each. When the
//! watermark passes a window end, the window's slices are combined and one
//! [`JoinProbeTask`] is emitted per hash partition. Each task reads the
//! combined slices, keeps the records whose key hash falls into its partition
//! and joins them with an in-memory hash table. Records sharing a hash bucket
//! only match when their keys compare equal.
//!
//! ```text
//!  left buffers ──► side 0 ┐
//!                          ├─► slices ──trigger──► window ──► task(p=0) ... task(p=n-1)
//!  right buffers ─► side 1 ┘                                   hash(key) % n == p
//! ```

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::buffer::{Buffer, BufferProvider};
use crate::slice::{CombinedSlice, PagedVector, SliceStore, WindowId};
use crate::time::{Watermark, WatermarkSnapshot};

use super::sliced::{SlicedOperator, TriggeredWindowData};
use super::{
    HandlerState, KeyEqFunction, KeyHashFunction, OperatorConfig, OperatorError, OperatorMetricsSnapshot,
    Output, OutputVec, QueryTerminationType, TaskMetadata, TimeFunction,
};

/// Identifies which side of the join a buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left side of the join.
    Left,
    /// Right side of the join.
    Right,
}

impl JoinSide {
    /// Build side index inside a slice.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }
}

/// Probe work for one hash partition of one triggered window.
#[derive(Clone)]
pub struct JoinProbeTask {
    metadata: TaskMetadata,
    window: WindowId,
    partition: usize,
    num_partitions: usize,
    slices: Arc<[CombinedSlice]>,
    key_hash: KeyHashFunction,
    key_eq: KeyEqFunction,
}

impl JoinProbeTask {
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

    /// Hash partition probed by this task.
    #[must_use]
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Number of hash partitions of the window.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Combined slices of the window, ordered by start.
    #[must_use]
    pub fn slices(&self) -> &[CombinedSlice] {
        &self.slices
    }

    /// Left records of the window that belong to this partition.
    pub fn left_records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.partition_records(JoinSide::Left).map(|(_, record)| record)
    }

    /// Right records of the window that belong to this partition.
    pub fn right_records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.partition_records(JoinSide::Right).map(|(_, record)| record)
    }

    fn partition_records(&self, side: JoinSide) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        let partitions = self.num_partitions as u64;
        let partition = self.partition as u64;
        self.slices
            .iter()
            .filter_map(move |slice| slice.side(side.index()))
            .flat_map(PagedVector::iter)
            .map(move |record| ((self.key_hash)(record), record))
            .filter(move |(hash, _)| hash % partitions == partition)
    }

    /// Joins the partition: builds a hash table over the left records and
    /// probes it with the right records.
    ///
    /// `on_match` is called with every `(left, right)` pair whose keys are
    /// equal. Returns the number of matches.
    pub fn execute<F>(&self, mut on_match: F) -> usize
    where
        F: FnMut(&[u8], &[u8]),
    {
        let mut table: FxHashMap<u64, SmallVec<[&[u8]; 4]>> = FxHashMap::default();
        for (hash, record) in self.partition_records(JoinSide::Left) {
            table.entry(hash).or_default().push(record);
        }
        if table.is_empty() {
            return 0;
        }

        let mut matches = 0;
        for (hash, right) in self.partition_records(JoinSide::Right) {
            if let Some(lefts) = table.get(&hash) {
                for left in lefts.iter().filter(|left| (self.key_eq)(left, right)) {
                    on_match(left, right);
                    matches += 1;
                }
            }
        }
        matches
    }
}

impl fmt::Debug for JoinProbeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinProbeTask")
            .field("metadata", &self.metadata)
            .field("window", &self.window)
            .field("partition", &self.partition)
            .field("num_partitions", &self.num_partitions)
            .field("slices", &self.slices.len())
            .finish_non_exhaustive()
    }
}

/// Operator handler for a windowed equi-join of two streams.
///
/// Shared by every worker thread: `process` takes `&self` and may be called
/// concurrently, each worker passing its own index.
pub struct JoinOperatorHandler {
    inner: SlicedOperator,
    key_hash: KeyHashFunction,
    key_eq: KeyEqFunction,
    num_partitions: usize,
}

impl JoinOperatorHandler {
    /// Creates a handler in the [`HandlerState::Created`] state.
    ///
    /// `key_hash` assigns records to partitions and buckets; `key_eq` decides
    /// whether a left and a right record in the same bucket join.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for an unusable window, a
    /// record size that does not fit the provider's pages, or no origins.
    pub fn new(
        config: OperatorConfig,
        provider: Arc<dyn BufferProvider>,
        time_fn: TimeFunction,
        key_hash: KeyHashFunction,
        key_eq: KeyEqFunction,
    ) -> Result<Self, OperatorError> {
        let num_partitions = config.num_partitions.max(1);
        let inner = SlicedOperator::new("join", &config, 2, num_partitions, provider, time_fn)?;
        Ok(Self {
            inner,
            key_hash,
            key_eq,
            num_partitions,
        })
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

    /// Builds one buffer of `side` into the slices and emits the probe tasks of
    /// every window the buffer's watermark completes.
    ///
    /// Late records are dropped or returned as [`Output::LateRecord`].
    ///
    /// # Errors
    ///
    /// - [`OperatorError::InvalidState`] unless the handler is running
    /// - [`OperatorError::MalformedBuffer`] if the tuple count exceeds the buffer
    /// - [`OperatorError::Watermark`] on a sequence protocol violation
    /// - [`OperatorError::Slice`] for an out-of-range worker or a failed spill
    pub fn process(
        &self,
        worker: usize,
        side: JoinSide,
        buffer: &Buffer,
    ) -> Result<OutputVec<JoinProbeTask>, OperatorError> {
        let processed = self.inner.process(worker, side.index(), buffer)?;
        let mut outputs = OutputVec::new();
        outputs.extend(processed.late.into_iter().map(Output::LateRecord));
        for triggered in processed.triggered {
            outputs.extend(self.probe_tasks(triggered).map(Output::Task));
        }
        Ok(outputs)
    }

    /// Stops the handler.
    ///
    /// A graceful stop emits probe tasks for every pending window; a hard
    /// stop discards them. Stopping twice returns no tasks.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Slice`] if spilled records cannot be read back
    /// while combining.
    pub fn stop(&self, termination: QueryTerminationType) -> Result<Vec<JoinProbeTask>, OperatorError> {
        let triggered = self.inner.stop(termination)?;
        Ok(triggered
            .into_iter()
            .flat_map(|window| self.probe_tasks(window))
            .collect())
    }

    fn probe_tasks(&self, triggered: TriggeredWindowData) -> impl Iterator<Item = JoinProbeTask> + '_ {
        let TriggeredWindowData {
            window,
            slices,
            metadata,
        } = triggered;
        metadata
            .into_iter()
            .enumerate()
            .map(move |(partition, metadata)| JoinProbeTask {
                metadata,
                window,
                partition,
                num_partitions: self.num_partitions,
                slices: Arc::clone(&slices),
                key_hash: Arc::clone(&self.key_hash),
                key_eq: Arc::clone(&self.key_eq),
            })
    }

    /// Number of hash partitions per window.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
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

impl fmt::Debug for JoinOperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinOperatorHandler")
            .field("state", &self.state())
            .field("num_partitions", &self.num_partitions)
            .field("watermark", &self.current_watermark())
            .finish_non_exhaustive()
    }
}
