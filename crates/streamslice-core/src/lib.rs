//! # `streamslice` Core
//!
//! Memory management, watermark tracking and time-sliced operator state for a
//! parallel stream-processing engine.
//!
//! This crate provides:
//! - **Buffers**: Reference-counted, recyclable buffers drawn from fixed pools
//! - **Time**: Watermarks, sequence data and the reordering watermark log
//! - **Slices**: Per-worker paged partitions of time slices, combined once
//! - **Operators**: Window aggregation and window join handlers
//!
//! ## Design Principles
//!
//! 1. **Bounded memory** - Every record lives in a pooled page
//! 2. **No shared hot-path writes** - Each worker appends to its own partition
//! 3. **Exactly-once triggering** - A window is handed out once, after its end
//!    has been passed by the watermark of every input origin
//!
//! ## Example
//!
//! ```rust,ignore
//! use streamslice_core::operator::{OperatorConfig, WindowOperatorHandler};
//!
//! let handler = WindowOperatorHandler::new(OperatorConfig::default(), provider, time_fn)?;
//! handler.start()?;
//! for task in handler.process(worker, &buffer)? {
//!     // aggregate the triggered windows
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Allowed in the buffer arena only
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod operator;
pub mod slice;
pub mod time;

// Re-export key types
pub use buffer::{Buffer, BufferPool, BufferPoolConfig, BufferProvider};
pub use operator::{JoinOperatorHandler, OperatorConfig, QueryTerminationType, WindowOperatorHandler};
pub use slice::{SliceStore, WindowType};
pub use time::{MultiOriginWatermarkProcessor, OriginId, SequenceData, Watermark};

/// Result type for streamslice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for streamslice-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer pool errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] buffer::BufferError),

    /// Watermark protocol errors
    #[error("Watermark error: {0}")]
    Watermark(#[from] time::WatermarkError),

    /// Slice errors
    #[error("Slice error: {0}")]
    Slice(#[from] slice::SliceError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),
}
