//! One time slice with per-worker, per-side partitions.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::buffer::BufferProvider;

use super::{PagedVector, SliceError};

enum SliceState {
    Open,
    Combined(CombinedSlice),
    Retired,
}

/// The merged, read-only contents of a combined slice, one vector per side.
///
/// Cheap to clone; clones share the same pages, which stay alive until the
/// last clone is dropped even if the slice itself is retired.
#[derive(Clone)]
pub struct CombinedSlice {
    start: i64,
    end: i64,
    sides: Arc<[PagedVector]>,
}

impl CombinedSlice {
    /// Slice start (inclusive).
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Slice end (exclusive).
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Merged records of `side`, or `None` if the slice has no such side.
    #[must_use]
    pub fn side(&self, side: usize) -> Option<&PagedVector> {
        self.sides.get(side)
    }

    /// Number of sides.
    #[must_use]
    pub fn num_sides(&self) -> usize {
        self.sides.len()
    }

    /// Number of records over all sides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sides.iter().map(PagedVector::len).sum()
    }

    /// Whether every side is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CombinedSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedSlice")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("sides", &self.sides)
            .finish()
    }
}

/// Build state for the time range `[start, end)`.
///
/// Each (side, worker) pair owns a private [`PagedVector`]. Appends take the
/// slice lock shared plus their own partition's mutex, so workers never wait
/// on each other. [`Slice::combine`] and [`Slice::retire`] take the slice lock
/// exclusively, which also waits out any append still in flight.
pub struct Slice {
    start: i64,
    end: i64,
    num_workers: usize,
    num_sides: usize,
    state: RwLock<SliceState>,
    partitions: Box<[CachePadded<Mutex<PagedVector>>]>,
}

impl Slice {
    /// Creates an open slice with empty partitions for every side and worker.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidRecordSize`] if `record_size` does not fit
    /// the provider's pages.
    pub fn new(
        start: i64,
        end: i64,
        num_workers: usize,
        num_sides: usize,
        record_size: usize,
        provider: &Arc<dyn BufferProvider>,
    ) -> Result<Self, SliceError> {
        let num_workers = num_workers.max(1);
        let num_sides = num_sides.max(1);
        let partitions = (0..num_workers * num_sides)
            .map(|_| {
                PagedVector::new(Arc::clone(provider), record_size)
                    .map(|vector| CachePadded::new(Mutex::new(vector)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            start,
            end,
            num_workers,
            num_sides,
            state: RwLock::new(SliceState::Open),
            partitions: partitions.into_boxed_slice(),
        })
    }

    /// Slice start (inclusive).
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Slice end (exclusive).
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Whether `ts` falls inside the slice.
    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Number of worker partitions per side.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of build sides.
    #[must_use]
    pub fn num_sides(&self) -> usize {
        self.num_sides
    }

    fn partition_index(&self, worker: usize, side: usize) -> Result<usize, SliceError> {
        if worker >= self.num_workers {
            return Err(SliceError::InvalidWorker {
                worker,
                workers: self.num_workers,
            });
        }
        if side >= self.num_sides {
            return Err(SliceError::InvalidSide {
                side,
                sides: self.num_sides,
            });
        }
        Ok(side * self.num_workers + worker)
    }

    fn check_open(&self, state: &SliceState) -> Result<(), SliceError> {
        match state {
            SliceState::Open => Ok(()),
            SliceState::Combined(_) => Err(SliceError::AlreadyCombined {
                start: self.start,
                end: self.end,
            }),
            SliceState::Retired => Err(SliceError::Retired {
                start: self.start,
                end: self.end,
            }),
        }
    }

    /// Appends a record to the partition of `worker` on `side`, waiting for a
    /// page if the pool is exhausted.
    ///
    /// The wait happens without holding the slice lock, so a slice can be
    /// combined or retired while one of its writers waits for memory; the
    /// writer then fails with the matching error.
    ///
    /// # Errors
    ///
    /// - [`SliceError::AlreadyCombined`] / [`SliceError::Retired`] once the
    ///   slice no longer accepts writes
    /// - [`SliceError::InvalidWorker`] / [`SliceError::InvalidSide`] for
    ///   out-of-range indices
    /// - [`SliceError::RecordSizeMismatch`] for a record of the wrong size
    pub fn append(&self, worker: usize, side: usize, record: &[u8]) -> Result<(), SliceError> {
        let index = self.partition_index(worker, side)?;
        let provider = {
            let state = self.state.read();
            self.check_open(&state)?;
            let mut partition = self.partitions[index].lock();
            match partition.try_append(record) {
                Err(SliceError::PagesExhausted) => Arc::clone(partition.provider()),
                result => return result,
            }
        };

        let page = provider.acquire_blocking();
        let state = self.state.read();
        self.check_open(&state)?;
        let mut partition = self.partitions[index].lock();
        partition.push_page(page);
        partition.try_append(record)
    }

    /// Like [`Slice::append`], but fails with [`SliceError::PagesExhausted`]
    /// instead of waiting for a page.
    ///
    /// # Errors
    ///
    /// See [`Slice::append`].
    pub fn try_append(&self, worker: usize, side: usize, record: &[u8]) -> Result<(), SliceError> {
        let index = self.partition_index(worker, side)?;
        let state = self.state.read();
        self.check_open(&state)?;
        self.partitions[index].lock().try_append(record)
    }

    /// Spills every partition owned by `worker` to `directory`.
    ///
    /// Returns the number of records written. A combined or retired slice
    /// spills nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWorker`] for an out-of-range worker and
    /// [`SliceError::Spill`] if writing fails.
    pub fn spill_worker(&self, worker: usize, directory: &Path) -> Result<usize, SliceError> {
        self.partition_index(worker, 0)?;
        let state = self.state.read();
        if self.check_open(&state).is_err() {
            return Ok(0);
        }
        let mut spilled = 0;
        for side in 0..self.num_sides {
            let index = self.partition_index(worker, side)?;
            spilled += self.partitions[index].lock().spill(directory)?;
        }
        Ok(spilled)
    }

    /// Merges every worker partition of each side into the first one.
    ///
    /// Returns the merged contents. Calling it again, from any thread, returns
    /// the same contents without merging twice. Spilled records are read back
    /// before the merged contents are published.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Retired`] for a retired slice and
    /// [`SliceError::Spill`] if spilled records cannot be read back.
    pub fn combine(&self) -> Result<CombinedSlice, SliceError> {
        if let SliceState::Combined(combined) = &*self.state.read() {
            return Ok(combined.clone());
        }

        let mut state = self.state.write();
        match &*state {
            SliceState::Combined(combined) => return Ok(combined.clone()),
            SliceState::Retired => {
                return Err(SliceError::Retired {
                    start: self.start,
                    end: self.end,
                })
            }
            SliceState::Open => {}
        }

        // Nothing leaves a partition until every spill file has been read
        // back, so a failed reload leaves the slice open and intact.
        for partition in self.partitions.iter() {
            partition.lock().reload()?;
        }

        let mut sides: SmallVec<[PagedVector; 2]> = SmallVec::new();
        for side in 0..self.num_sides {
            let base = side * self.num_workers;
            let mut merged = self.partitions[base].lock().take();
            for worker in 1..self.num_workers {
                merged.append_all(self.partitions[base + worker].lock().take())?;
            }
            sides.push(merged);
        }

        let combined = CombinedSlice {
            start: self.start,
            end: self.end,
            sides: sides.into_iter().collect(),
        };
        *state = SliceState::Combined(combined.clone());
        Ok(combined)
    }

    /// Returns the merged contents if the slice has been combined.
    #[must_use]
    pub fn combined(&self) -> Option<CombinedSlice> {
        match &*self.state.read() {
            SliceState::Combined(combined) => Some(combined.clone()),
            _ => None,
        }
    }

    /// Whether the slice has been combined.
    #[must_use]
    pub fn is_combined(&self) -> bool {
        matches!(&*self.state.read(), SliceState::Combined(_))
    }

    /// Whether the slice has been retired.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        matches!(&*self.state.read(), SliceState::Retired)
    }

    /// Stops accepting writes and releases the slice's pages.
    ///
    /// Merged contents already handed out stay readable through their
    /// [`CombinedSlice`] clones.
    pub fn retire(&self) {
        let mut state = self.state.write();
        for partition in self.partitions.iter() {
            drop(partition.lock().take());
        }
        *state = SliceState::Retired;
    }

    /// Number of records appended to `side`, over all workers.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidSide`] for an out-of-range side.
    pub fn record_count(&self, side: usize) -> Result<usize, SliceError> {
        self.partition_index(0, side)?;
        let state = self.state.read();
        if let SliceState::Combined(combined) = &*state {
            return Ok(combined.side(side).map_or(0, PagedVector::len));
        }
        let base = side * self.num_workers;
        Ok((0..self.num_workers)
            .map(|worker| self.partitions[base + worker].lock().len())
            .sum())
    }

    /// Number of records in one worker's partition of `side`.
    ///
    /// After combining, every partition reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWorker`] / [`SliceError::InvalidSide`]
    /// for out-of-range indices.
    pub fn partition_len(&self, worker: usize, side: usize) -> Result<usize, SliceError> {
        let index = self.partition_index(worker, side)?;
        Ok(self.partitions[index].lock().len())
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.read() {
            SliceState::Open => "open",
            SliceState::Combined(_) => "combined",
            SliceState::Retired => "retired",
        };
        f.debug_struct("Slice")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("workers", &self.num_workers)
            .field("sides", &self.num_sides)
            .field("state", &state)
            .finish()
    }
}
