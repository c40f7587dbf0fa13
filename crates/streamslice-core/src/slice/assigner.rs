//! Mapping from record timestamps to slice and window boundaries.
//!
//! Windows start at multiples of the slide. A slice boundary sits at every
//! window start and every window end, so each slice lies entirely inside or
//! entirely outside every window and a window is the union of its slices.
//!
//! ```text
//! size=10, slide=5
//! windows:  [0,10)     [10,20)
//!                [5,15)     [15,25)
//! slices:   [0,5) [5,10) [10,15) [15,20) ...
//! ```
//!
//! Timestamps may be negative; boundaries use Euclidean remainders so that
//! `-1` falls into `[-10, 0)` rather than `[0, 10)`. Boundaries saturate at
//! the ends of the `i64` range; [`SliceAssigner::supports`] tells whether every
//! window of a timestamp is representable.

use smallvec::SmallVec;

use super::{SliceError, WindowId};

/// Window shape of a windowed aggregation or join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Fixed-size, non-overlapping windows.
    Tumbling {
        /// Window size.
        size: i64,
    },
    /// Fixed-size windows starting every `slide`.
    Sliding {
        /// Window size.
        size: i64,
        /// Distance between consecutive window starts.
        slide: i64,
    },
}

impl WindowType {
    /// Window size.
    #[must_use]
    pub fn size(&self) -> i64 {
        match *self {
            Self::Tumbling { size } | Self::Sliding { size, .. } => size,
        }
    }

    /// Distance between consecutive window starts.
    #[must_use]
    pub fn slide(&self) -> i64 {
        match *self {
            Self::Tumbling { size } => size,
            Self::Sliding { slide, .. } => slide,
        }
    }
}

/// Computes slice and window boundaries for one [`WindowType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: i64,
    slide: i64,
}

impl SliceAssigner {
    /// Creates an assigner.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidWindow`] unless `0 < slide <= size`.
    pub fn new(window: WindowType) -> Result<Self, SliceError> {
        let (size, slide) = (window.size(), window.slide());
        if size <= 0 || slide <= 0 || slide > size {
            return Err(SliceError::InvalidWindow(format!(
                "size {size} and slide {slide} must satisfy 0 < slide <= size"
            )));
        }
        Ok(Self { size, slide })
    }

    /// Window size.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Window slide.
    #[must_use]
    pub fn slide(&self) -> i64 {
        self.slide
    }

    /// Whether every window containing `ts` starts and ends inside the `i64`
    /// range.
    #[must_use]
    pub fn supports(&self, ts: i64) -> bool {
        (i64::MIN + self.size..=i64::MAX - self.size).contains(&ts)
    }

    /// Distances from `ts` back to the previous window start and the previous
    /// window end.
    fn offsets(&self, ts: i64) -> (i64, i64) {
        let since_start = ts.rem_euclid(self.slide);
        let since_end = (since_start - self.size.rem_euclid(self.slide)).rem_euclid(self.slide);
        (since_start, since_end)
    }

    /// Start of the slice containing `ts`.
    #[must_use]
    pub fn slice_start(&self, ts: i64) -> i64 {
        let (since_start, since_end) = self.offsets(ts);
        ts.saturating_sub(since_start).max(ts.saturating_sub(since_end))
    }

    /// Exclusive end of the slice containing `ts`.
    #[must_use]
    pub fn slice_end(&self, ts: i64) -> i64 {
        let (since_start, since_end) = self.offsets(ts);
        let next_window_start = ts.saturating_add(self.slide - since_start);
        let next_window_end = ts.saturating_add(self.slide - since_end);
        next_window_start.min(next_window_end)
    }

    /// The slice `[start, end)` containing `ts`.
    #[must_use]
    pub fn slice_bounds(&self, ts: i64) -> (i64, i64) {
        (self.slice_start(ts), self.slice_end(ts))
    }

    /// Every window containing the slice that starts at `slice_start`, ordered by end.
    #[must_use]
    pub fn windows_for_slice(&self, slice_start: i64) -> SmallVec<[WindowId; 4]> {
        let slice_end = self.slice_end(slice_start);
        let latest_start = slice_start.saturating_sub(slice_start.rem_euclid(self.slide));
        let mut windows = SmallVec::new();
        let mut start = latest_start;
        while start.saturating_add(self.size) >= slice_end {
            windows.push(WindowId::new(start, start.saturating_add(self.size)));
            match start.checked_sub(self.slide) {
                Some(prev) => start = prev,
                None => break,
            }
        }
        windows.reverse();
        windows
    }

    /// End of the last window containing the slice that starts at `slice_start`.
    ///
    /// Once the watermark reaches it, no window needs the slice any more.
    #[must_use]
    pub fn last_window_end(&self, slice_start: i64) -> i64 {
        slice_start
            .saturating_sub(slice_start.rem_euclid(self.slide))
            .saturating_add(self.size)
    }
}
