//! The keyed collection of live slices for one operator instance.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::debug;

use crate::buffer::BufferProvider;

use super::{Slice, SliceAssigner, SliceError, WindowId, WindowType};

/// Configuration for a [`SliceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceStoreConfig {
    /// Window shape.
    pub window: WindowType,
    /// Worker threads appending into each slice.
    pub num_workers: usize,
    /// Build sides per slice (1 for aggregations, 2 for joins).
    pub num_sides: usize,
    /// Size of one record in bytes.
    pub record_size: usize,
}

impl Default for SliceStoreConfig {
    fn default() -> Self {
        Self {
            window: WindowType::Tumbling { size: 1000 },
            num_workers: 1,
            num_sides: 1,
            record_size: 16,
        }
    }
}

/// Lifecycle of a window tracked by a [`SliceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Slices of the window still accept records.
    Filling,
    /// The window has been handed out for probing or aggregation.
    EmittedToProbe,
}

struct WindowEntry {
    state: WindowState,
    slices: SmallVec<[Arc<Slice>; 4]>,
}

/// A window handed out for triggering, with the slices that make it up.
#[derive(Debug, Clone)]
pub struct TriggeredWindow {
    /// The window.
    pub window: WindowId,
    /// Its slices, ordered by start.
    pub slices: Vec<Arc<Slice>>,
}

/// Owns the live slices of one operator, keyed by slice start.
///
/// Slices are created on demand by [`SliceStore::get_or_create_slice`] and
/// registered with every window that contains them. Windows are handed out
/// exactly once, either by [`SliceStore::collect_windows_to_trigger`] or by
/// [`SliceStore::trigger_all_windows`], and [`SliceStore::remove_expired`]
/// drops them (and the slices no pending window needs) once the watermark
/// has passed.
///
/// The slice map and the window map have their own locks, always taken in
/// that order. Neither is held while records are appended or slices are
/// combined.
pub struct SliceStore {
    assigner: SliceAssigner,
    provider: Arc<dyn BufferProvider>,
    num_workers: usize,
    num_sides: usize,
    record_size: usize,
    slices: RwLock<BTreeMap<i64, Arc<Slice>>>,
    windows: Mutex<BTreeMap<WindowId, WindowEntry>>,
    triggered_up_to: AtomicI64,
    expired_up_to: AtomicI64,
}

impl SliceStore {
    /// Creates an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWindow`] for unusable window parameters and
    /// [`SliceError::InvalidRecordSize`] if records do not fit the provider's pages.
    pub fn new(
        config: SliceStoreConfig,
        provider: Arc<dyn BufferProvider>,
    ) -> Result<Self, SliceError> {
        let assigner = SliceAssigner::new(config.window)?;
        let page_size = provider.buffer_size();
        if config.record_size == 0 || config.record_size > page_size {
            return Err(SliceError::InvalidRecordSize {
                record_size: config.record_size,
                page_size,
            });
        }
        Ok(Self {
            assigner,
            provider,
            num_workers: config.num_workers.max(1),
            num_sides: config.num_sides.max(1),
            record_size: config.record_size,
            slices: RwLock::new(BTreeMap::new()),
            windows: Mutex::new(BTreeMap::new()),
            triggered_up_to: AtomicI64::new(i64::MIN),
            expired_up_to: AtomicI64::new(i64::MIN),
        })
    }

    /// The slice assigner in use.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Returns the slice containing `ts`, creating it if needed.
    ///
    /// Concurrent callers for the same range all observe the same slice.
    ///
    /// # Errors
    ///
    /// - [`SliceError::SliceExpired`] if the store already deleted the range
    /// - [`SliceError::WindowAlreadyTriggered`] if a window containing the
    ///   range has already been handed out
    /// - [`SliceError::TimestampOutOfRange`] if the windows of `ts` do not
    ///   fit the `i64` range
    pub fn get_or_create_slice(&self, ts: i64) -> Result<Arc<Slice>, SliceError> {
        if !self.assigner.supports(ts) {
            let size = self.assigner.size();
            return Err(SliceError::TimestampOutOfRange {
                ts,
                min: i64::MIN + size,
                max: i64::MAX - size,
            });
        }
        let (start, end) = self.assigner.slice_bounds(ts);
        if let Some(slice) = self.slices.read().get(&start) {
            return Ok(Arc::clone(slice));
        }

        let mut slices = self.slices.write();
        if let Some(slice) = slices.get(&start) {
            return Ok(Arc::clone(slice));
        }

        let expired = self.expired_up_to.load(Ordering::Acquire);
        let windows_of_slice = self.assigner.windows_for_slice(start);
        let first_end = windows_of_slice.first().map_or(end, |w| w.end);
        if first_end <= expired {
            return Err(SliceError::SliceExpired {
                ts,
                start,
                end,
                watermark: expired,
            });
        }

        let mut windows = self.windows.lock();
        let triggered = self.triggered_up_to.load(Ordering::Acquire);
        for window in &windows_of_slice {
            let emitted = windows
                .get(window)
                .is_some_and(|entry| entry.state == WindowState::EmittedToProbe);
            if emitted || window.end <= triggered {
                return Err(SliceError::WindowAlreadyTriggered { window: *window });
            }
        }

        let slice = Arc::new(Slice::new(
            start,
            end,
            self.num_workers,
            self.num_sides,
            self.record_size,
            &self.provider,
        )?);
        for window in windows_of_slice {
            windows
                .entry(window)
                .or_insert_with(|| WindowEntry {
                    state: WindowState::Filling,
                    slices: SmallVec::new(),
                })
                .slices
                .push(Arc::clone(&slice));
        }
        slices.insert(start, Arc::clone(&slice));
        Ok(slice)
    }

    /// Hands out every window whose end lies in `(previous, current]`.
    ///
    /// Each window is returned exactly once over all calls, ordered by end,
    /// and moves to [`WindowState::EmittedToProbe`]. The caller combines the
    /// returned slices.
    #[must_use]
    pub fn collect_windows_to_trigger(&self, previous: i64, current: i64) -> Vec<TriggeredWindow> {
        let mut windows = self.windows.lock();
        self.triggered_up_to.fetch_max(current, Ordering::AcqRel);
        let mut triggered: Vec<TriggeredWindow> = windows
            .iter_mut()
            .filter(|(id, entry)| {
                entry.state == WindowState::Filling && id.end > previous && id.end <= current
            })
            .map(|(id, entry)| {
                entry.state = WindowState::EmittedToProbe;
                Self::triggered(*id, entry)
            })
            .collect();
        triggered.sort_by_key(|t| (t.window.end, t.window.start));
        if !triggered.is_empty() {
            debug!(
                previous,
                current,
                windows = triggered.len(),
                "collected windows to trigger"
            );
        }
        triggered
    }

    /// Hands out every window still filling, regardless of the watermark.
    ///
    /// Used on graceful termination. Afterwards no new slice can be created.
    #[must_use]
    pub fn trigger_all_windows(&self) -> Vec<TriggeredWindow> {
        let mut windows = self.windows.lock();
        self.triggered_up_to.store(i64::MAX, Ordering::Release);
        let mut triggered: Vec<TriggeredWindow> = windows
            .iter_mut()
            .filter(|(_, entry)| entry.state == WindowState::Filling)
            .map(|(id, entry)| {
                entry.state = WindowState::EmittedToProbe;
                Self::triggered(*id, entry)
            })
            .collect();
        triggered.sort_by_key(|t| (t.window.end, t.window.start));
        triggered
    }

    fn triggered(window: WindowId, entry: &WindowEntry) -> TriggeredWindow {
        let mut slices: Vec<Arc<Slice>> = entry.slices.iter().cloned().collect();
        slices.sort_by_key(|slice| slice.start());
        TriggeredWindow { window, slices }
    }

    /// Deletes emitted windows ending at or before `watermark`, and the slices
    /// whose every window has ended and been emitted.
    ///
    /// Deleted slices are retired under their own lock after the store's locks
    /// are released, so an append still in flight on one slice holds up
    /// neither the store nor other slices. Returns the number of slices removed.
    pub fn remove_expired(&self, watermark: i64) -> usize {
        let expired: Vec<Arc<Slice>> = {
            let mut slices = self.slices.write();
            let mut windows = self.windows.lock();
            self.expired_up_to.fetch_max(watermark, Ordering::AcqRel);

            windows.retain(|id, entry| {
                !(entry.state == WindowState::EmittedToProbe && id.end <= watermark)
            });

            let starts: Vec<i64> = slices
                .keys()
                .copied()
                .filter(|&start| {
                    self.assigner.last_window_end(start) <= watermark
                        && self
                            .assigner
                            .windows_for_slice(start)
                            .iter()
                            .all(|window| !windows.contains_key(window))
                })
                .collect();
            starts
                .iter()
                .filter_map(|start| slices.remove(start))
                .collect()
        };

        for slice in &expired {
            slice.retire();
        }
        if !expired.is_empty() {
            debug!(watermark, slices = expired.len(), "removed expired slices");
        }
        expired.len()
    }

    /// Retires every slice and forgets every window. Used on hard stop.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut slices = self.slices.write();
            let mut windows = self.windows.lock();
            self.triggered_up_to.store(i64::MAX, Ordering::Release);
            self.expired_up_to.store(i64::MAX, Ordering::Release);
            windows.clear();
            std::mem::take(&mut *slices)
        };
        for slice in removed.values() {
            slice.retire();
        }
        removed.len()
    }

    /// Spills `worker`'s partitions of every open slice to `directory`.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Spill`] if writing fails.
    pub fn spill_worker(&self, worker: usize, directory: &Path) -> Result<usize, SliceError> {
        let open: Vec<Arc<Slice>> = self.slices.read().values().cloned().collect();
        let mut spilled = 0;
        for slice in open {
            spilled += slice.spill_worker(worker, directory)?;
        }
        Ok(spilled)
    }

    /// Returns the slice starting at `start`, if it is live.
    #[must_use]
    pub fn slice(&self, start: i64) -> Option<Arc<Slice>> {
        self.slices.read().get(&start).cloned()
    }

    /// Returns the state of `window`, if the store tracks it.
    #[must_use]
    pub fn window_state(&self, window: WindowId) -> Option<WindowState> {
        self.windows.lock().get(&window).map(|entry| entry.state)
    }

    /// Number of live slices.
    #[must_use]
    pub fn num_slices(&self) -> usize {
        self.slices.read().len()
    }

    /// Number of tracked windows.
    #[must_use]
    pub fn num_windows(&self) -> usize {
        self.windows.lock().len()
    }

    /// Largest watermark passed to [`SliceStore::collect_windows_to_trigger`].
    #[must_use]
    pub fn triggered_up_to(&self) -> i64 {
        self.triggered_up_to.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SliceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceStore")
            .field("assigner", &self.assigner)
            .field("slices", &self.num_slices())
            .field("windows", &self.num_windows())
            .finish_non_exhaustive()
    }
}
