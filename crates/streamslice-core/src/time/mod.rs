//! # Time Module
//!
//! Event-time progress tracking for buffered, out-of-order input.
//!
//! ## Concepts
//!
//! - **Origin**: a logical input stream; sequence numbers and watermarks are
//!   scoped to one origin
//! - **Sequence number**: strictly increasing per origin, one per buffer
//! - **Watermark**: assertion that no record with a timestamp below it will
//!   arrive from the origin any more
//!
//! Worker threads process buffers in whatever order they are scheduled. The
//! [`WatermarkProcessor`] absorbs that reordering: a buffer's watermark only
//! becomes visible once every buffer with a smaller sequence number from the
//! same origin has been seen.
//!
//! ```rust
//! use streamslice_core::time::{SequenceData, Watermark, WatermarkConfig, WatermarkProcessor};
//!
//! let processor = WatermarkProcessor::new(WatermarkConfig::default());
//!
//! // Sequence 1 arrives before sequence 0: nothing can be released yet.
//! assert_eq!(processor.update(Watermark::new(20), SequenceData::new(1))?, Watermark::MIN);
//!
//! // Sequence 0 closes the gap; both updates are applied.
//! assert_eq!(processor.update(Watermark::new(10), SequenceData::new(0))?, Watermark::new(20));
//! # Ok::<(), streamslice_core::time::WatermarkError>(())
//! ```
//!
//! For operators fed by several origins, [`MultiOriginWatermarkProcessor`]
//! reduces the per-origin watermarks to their minimum: the slowest origin
//! decides.

mod multi_origin;
mod processor;

pub use multi_origin::{MultiOriginWatermarkProcessor, OriginWatermark, WatermarkSnapshot};
pub use processor::WatermarkProcessor;

use std::fmt;
use std::time::Duration;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// A watermark indicating event-time progress.
///
/// # Example
///
/// ```rust
/// use streamslice_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub struct Watermark(pub i64);

impl Watermark {
    /// The watermark before any progress has been made.
    pub const MIN: Watermark = Watermark(i64::MIN);

    /// The watermark after all input has been seen.
    pub const MAX: Watermark = Watermark(i64::MAX);

    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub const fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp.
    #[inline]
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if a record is late relative to this watermark.
    ///
    /// A record is late if its timestamp is strictly less than the watermark.
    #[inline]
    #[must_use]
    pub const fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns the minimum (earlier) of two watermarks.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            i64::MIN => f.write_str("-inf"),
            i64::MAX => f.write_str("+inf"),
            ts => write!(f, "{ts}"),
        }
    }
}

/// Identifier of a logical input stream.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
pub struct OriginId(pub u64);

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// Position of a buffer within its origin's stream.
///
/// A producer may split one logical sequence number across several chunks.
/// Chunk numbers start at 1 and the final chunk carries `last_chunk`.
/// An unchunked buffer is chunk 1 with `last_chunk` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceData {
    /// Sequence number, strictly increasing per origin.
    pub sequence_number: u64,
    /// Chunk number within the sequence, starting at 1.
    pub chunk_number: u64,
    /// Whether this is the final chunk of the sequence.
    pub last_chunk: bool,
}

impl SequenceData {
    /// First chunk number of every sequence.
    pub const INITIAL_CHUNK_NUMBER: u64 = 1;

    /// An unchunked sequence number.
    #[must_use]
    pub const fn new(sequence_number: u64) -> Self {
        Self {
            sequence_number,
            chunk_number: Self::INITIAL_CHUNK_NUMBER,
            last_chunk: true,
        }
    }

    /// One chunk of a sequence number.
    #[must_use]
    pub const fn chunk(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Whether the sequence number was split into several chunks.
    #[must_use]
    pub const fn is_chunked(&self) -> bool {
        !(self.chunk_number == Self::INITIAL_CHUNK_NUMBER && self.last_chunk)
    }
}

impl Default for SequenceData {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} chunk={}{}",
            self.sequence_number,
            self.chunk_number,
            if self.last_chunk { " (last)" } else { "" }
        )
    }
}

/// What to do with a sequence number too far ahead of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOverflowPolicy {
    /// Fail immediately with [`WatermarkError::SequenceGapExceedsLog`].
    Reject,
    /// Back off until other threads close the gap, failing after `timeout`.
    SpinWait {
        /// Longest time to wait for the gap to close.
        timeout: Duration,
    },
}

impl Default for LogOverflowPolicy {
    fn default() -> Self {
        Self::SpinWait {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Default number of slots in a watermark log.
pub const DEFAULT_LOG_SIZE: usize = 1024;

/// Configuration for a [`WatermarkProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkConfig {
    /// Number of slots in the circular log; bounds the in-flight reordering.
    pub log_size: usize,
    /// Sequence number expected first from every origin.
    pub initial_sequence: u64,
    /// Policy for sequence numbers that would outrun the log.
    pub overflow_policy: LogOverflowPolicy,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            log_size: DEFAULT_LOG_SIZE,
            initial_sequence: 0,
            overflow_policy: LogOverflowPolicy::default(),
        }
    }
}

impl WatermarkConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> WatermarkConfigBuilder {
        WatermarkConfigBuilder::default()
    }
}

/// Builder for [`WatermarkConfig`].
#[derive(Debug, Default)]
pub struct WatermarkConfigBuilder {
    log_size: Option<usize>,
    initial_sequence: Option<u64>,
    overflow_policy: Option<LogOverflowPolicy>,
}

impl WatermarkConfigBuilder {
    /// Sets the log size (clamped to `1..=1 << 20`).
    #[must_use]
    pub fn log_size(mut self, size: usize) -> Self {
        self.log_size = Some(size.clamp(1, 1 << 20));
        self
    }

    /// Sets the first expected sequence number.
    #[must_use]
    pub fn initial_sequence(mut self, sequence: u64) -> Self {
        self.initial_sequence = Some(sequence);
        self
    }

    /// Sets the log overflow policy.
    #[must_use]
    pub fn overflow_policy(mut self, policy: LogOverflowPolicy) -> Self {
        self.overflow_policy = Some(policy);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> WatermarkConfig {
        WatermarkConfig {
            log_size: self.log_size.unwrap_or(DEFAULT_LOG_SIZE),
            initial_sequence: self.initial_sequence.unwrap_or(0),
            overflow_policy: self.overflow_policy.unwrap_or_default(),
        }
    }
}

/// Errors from watermark tracking.
///
/// Every variant is a broken upstream contract and is fatal to the operator
/// instance that observes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatermarkError {
    /// A sequence number was presented twice or after it was applied.
    #[error("sequence regression on {origin}: got {sequence}, next expected {expected}")]
    SequenceRegression {
        /// Offending origin.
        origin: OriginId,
        /// Sequence number presented.
        sequence: u64,
        /// Next sequence number the processor was waiting for.
        expected: u64,
    },

    /// A sequence number is further ahead of the log position than the log holds.
    #[error("sequence {sequence} on {origin} is {gap} ahead of {expected}, log holds {log_size}")]
    SequenceGapExceedsLog {
        /// Offending origin.
        origin: OriginId,
        /// Sequence number presented.
        sequence: u64,
        /// Next sequence number the processor was waiting for.
        expected: u64,
        /// Distance between the two.
        gap: u64,
        /// Configured log size.
        log_size: usize,
    },

    /// A chunk number was repeated, was 0, or contradicts the last chunk.
    #[error("invalid chunk {chunk} of sequence {sequence} on {origin}")]
    DuplicateChunk {
        /// Offending origin.
        origin: OriginId,
        /// Sequence number the chunk belongs to.
        sequence: u64,
        /// Chunk number presented.
        chunk: u64,
    },

    /// An update named an origin the processor was not built for.
    #[error("unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// A snapshot could not be encoded or decoded.
    #[error("watermark snapshot error: {0}")]
    Snapshot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_lateness() {
        let wm = Watermark::new(100);
        assert!(wm.is_late(99));
        assert!(!wm.is_late(100));
        assert!(!Watermark::MIN.is_late(i64::MIN));
        assert_eq!(Watermark::default(), Watermark::MIN);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::MIN.to_string(), "-inf");
        assert_eq!(Watermark::new(42).to_string(), "42");
    }

    #[test]
    fn test_sequence_data_chunking() {
        assert!(!SequenceData::new(5).is_chunked());
        assert!(SequenceData::chunk(5, 1, false).is_chunked());
        assert!(SequenceData::chunk(5, 2, true).is_chunked());
    }

    #[test]
    fn test_config_builder_clamps_log_size() {
        let config = WatermarkConfig::builder().log_size(0).build();
        assert_eq!(config.log_size, 1);
        assert_eq!(config.initial_sequence, 0);
        assert!(matches!(
            config.overflow_policy,
            LogOverflowPolicy::SpinWait { .. }
        ));
    }
}
