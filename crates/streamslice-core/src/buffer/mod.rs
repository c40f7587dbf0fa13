//! # Buffer Module
//!
//! Reference-counted, recyclable memory buffers shared between pipeline stages.
//!
//! ## Ownership Model
//!
//! A [`BufferPool`] preallocates a fixed number of fixed-size memory blocks
//! (an arena of slots). A [`Buffer`] is a handle to one slot: the slot index
//! plus the generation the slot had when it was handed out. Every handle owns
//! one reference; cloning a handle ([`Buffer::retain`]) adds a reference and
//! dropping it ([`Buffer::release`]) removes one. When the count reaches zero
//! the slot's metadata is reset, its generation is bumped and the slot goes
//! back on the free list of the pool that handed it out. That is the only path
//! by which memory returns to a pool.
//!
//! ```text
//!   acquire ──► refs=1 ──retain──► refs=2 ──release──► refs=1 ──release──► refs=0
//!                                                                         │
//!                                    free list ◄── reset + generation++ ◄─┘
//! ```
//!
//! ## Write-once Convention
//!
//! A buffer is written by its producer while it holds the only reference
//! ([`Buffer::as_mut_slice`] returns `None` otherwise) and is read-only once it
//! has been retained.
//!
//! ## Example
//!
//! ```rust
//! use streamslice_core::buffer::{BufferPool, BufferPoolConfig, BufferProvider};
//!
//! let pool = BufferPool::new(BufferPoolConfig::builder().buffer_size(64).num_buffers(2).build())?;
//!
//! let mut buffer = pool.try_acquire().expect("pool has free buffers");
//! buffer.as_mut_slice().unwrap()[..5].copy_from_slice(b"hello");
//! buffer.set_tuple_count(1);
//!
//! let shared = buffer.retain();
//! assert_eq!(shared.reference_count(), 2);
//! assert_eq!(&shared.as_slice()[..5], b"hello");
//!
//! drop(buffer);
//! drop(shared);
//! assert_eq!(pool.available_buffers(), 2);
//! # Ok::<(), streamslice_core::buffer::BufferError>(())
//! ```

mod handle;
mod pool;

pub use handle::Buffer;
pub use pool::{BufferPool, BufferPoolStats, BufferProvider, FixedSizeBufferPool};

/// Default size of a single pooled buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of buffers preallocated by a pool.
pub const DEFAULT_NUM_BUFFERS: usize = 1024;

/// Errors raised by buffer pools.
///
/// Exhaustion under the non-blocking acquire path is not an error: it is
/// reported as `None` so that callers can apply backpressure.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The pool configuration cannot be satisfied.
    #[error("invalid buffer pool configuration: {0}")]
    InvalidConfig(String),

    /// A fixed-size sub-pool asked for more buffers than are currently free.
    #[error("cannot reserve {requested} buffers, only {available} available")]
    InsufficientBuffers {
        /// Buffers requested.
        requested: usize,
        /// Buffers free at the time of the request.
        available: usize,
    },
}

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers to preallocate.
    pub num_buffers: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
        }
    }
}

impl BufferPoolConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> BufferPoolConfigBuilder {
        BufferPoolConfigBuilder::default()
    }

    /// Total bytes preallocated by a pool with this configuration.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.buffer_size.saturating_mul(self.num_buffers)
    }
}

/// Builder for [`BufferPoolConfig`].
#[derive(Debug, Default)]
pub struct BufferPoolConfigBuilder {
    buffer_size: Option<usize>,
    num_buffers: Option<usize>,
}

impl BufferPoolConfigBuilder {
    /// Sets the size of each buffer in bytes (at least 8).
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(8));
        self
    }

    /// Sets the number of buffers (clamped to `1..=u32::MAX`).
    #[must_use]
    pub fn num_buffers(mut self, count: usize) -> Self {
        self.num_buffers = Some(count.clamp(1, u32::MAX as usize));
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> BufferPoolConfig {
        BufferPoolConfig {
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            num_buffers: self.num_buffers.unwrap_or(DEFAULT_NUM_BUFFERS),
        }
    }
}
