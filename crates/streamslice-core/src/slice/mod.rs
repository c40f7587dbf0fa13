//! # Slice Module
//!
//! Time-partitioned build state for windowed aggregations and joins.
//!
//! ## Layout
//!
//! ```text
//! SliceStore
//!   slices:  start -> Slice [start, end)
//!                       side 0: worker 0 | worker 1 | ... | worker N-1   (PagedVector each)
//!                       side 1: worker 0 | worker 1 | ... | worker N-1
//!   windows: WindowId -> Filling | EmittedToProbe, slices covering it
//! ```
//!
//! - **Build**: every worker appends into its own partition of a slice, so
//!   appends from different workers never contend.
//! - **Combine**: when the watermark reaches the end of a window, each slice
//!   of the window merges its partitions into one per side. Combining is
//!   idempotent and happens under the slice's exclusive lock.
//! - **Trigger**: [`SliceStore::collect_windows_to_trigger`] hands out every
//!   window exactly once.
//! - **Expiry**: [`SliceStore::remove_expired`] drops emitted windows and the
//!   slices no pending window needs.

mod assigner;
mod paged;
mod spill;
mod store;
mod time_slice;

pub use assigner::{SliceAssigner, WindowType};
pub use paged::PagedVector;
pub use spill::{SpillConfig, SpillError};
pub use store::{SliceStore, SliceStoreConfig, TriggeredWindow, WindowState};
pub use time_slice::{CombinedSlice, Slice};

use std::fmt;

/// Identifies a window by its half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId {
    /// Window start timestamp (inclusive).
    pub start: i64,
    /// Window end timestamp (exclusive).
    pub end: i64,
}

impl WindowId {
    /// Creates a new window ID.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Whether `ts` falls inside the window.
    #[must_use]
    pub const fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Errors from slices and the slice store.
#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    /// Window parameters are unusable.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Records do not fit a page.
    #[error("record size {record_size} does not fit page size {page_size}")]
    InvalidRecordSize {
        /// Configured record size.
        record_size: usize,
        /// Page (buffer) size of the provider.
        page_size: usize,
    },

    /// A record did not have the configured size.
    #[error("record size mismatch: expected {expected} bytes, got {actual}")]
    RecordSizeMismatch {
        /// Configured record size.
        expected: usize,
        /// Size presented.
        actual: usize,
    },

    /// No free page for a non-blocking append.
    #[error("no free page for append")]
    PagesExhausted,

    /// A page was retained by someone else and is read-only.
    #[error("page is shared and cannot be written")]
    SharedPage,

    /// A worker index beyond the configured worker count.
    #[error("worker {worker} out of range, slice has {workers} workers")]
    InvalidWorker {
        /// Worker presented.
        worker: usize,
        /// Configured workers.
        workers: usize,
    },

    /// A build side beyond the configured side count.
    #[error("side {side} out of range, slice has {sides} sides")]
    InvalidSide {
        /// Side presented.
        side: usize,
        /// Configured sides.
        sides: usize,
    },

    /// Write to a slice whose partitions were already merged.
    #[error("slice [{start}, {end}) is already combined")]
    AlreadyCombined {
        /// Slice start.
        start: i64,
        /// Slice end.
        end: i64,
    },

    /// Access to a slice that was removed from its store.
    #[error("slice [{start}, {end}) has been retired")]
    Retired {
        /// Slice start.
        start: i64,
        /// Slice end.
        end: i64,
    },

    /// A slice was requested for a range the store has already deleted.
    #[error("slice [{start}, {end}) for timestamp {ts} expired at watermark {watermark}")]
    SliceExpired {
        /// Timestamp that mapped to the slice.
        ts: i64,
        /// Slice start.
        start: i64,
        /// Slice end.
        end: i64,
        /// Watermark at which the store removed it.
        watermark: i64,
    },

    /// A timestamp lies too close to the ends of the `i64` range for its
    /// windows to be representable.
    #[error("timestamp {ts} outside the supported range [{min}, {max}]")]
    TimestampOutOfRange {
        /// Offending timestamp.
        ts: i64,
        /// Smallest supported timestamp.
        min: i64,
        /// Largest supported timestamp.
        max: i64,
    },

    /// A slice was requested for a window that has already been triggered.
    #[error("window {window} has already been triggered")]
    WindowAlreadyTriggered {
        /// The triggered window.
        window: WindowId,
    },

    /// Spilling failed.
    #[error("spill error: {0}")]
    Spill(#[from] SpillError),
}
