//! Global and fixed-size buffer pools.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::handle::{Arena, Buffer, BufferRecycler};
use super::{BufferError, BufferPoolConfig};

/// A source of pooled buffers.
///
/// Implemented by [`BufferPool`] and [`FixedSizeBufferPool`] so that paged
/// collections can draw pages from either.
pub trait BufferProvider: Send + Sync {
    /// Size in bytes of every buffer handed out.
    fn buffer_size(&self) -> usize;

    /// Acquires a buffer, waiting for a release if none is free.
    fn acquire_blocking(&self) -> Buffer;

    /// Acquires a buffer if one is free.
    ///
    /// `None` means the provider is exhausted; callers apply backpressure.
    fn try_acquire(&self) -> Option<Buffer>;

    /// Acquires a buffer, waiting at most `timeout` for a release.
    fn acquire_timeout(&self, timeout: Duration) -> Option<Buffer>;

    /// Number of buffers currently free.
    fn available_buffers(&self) -> usize;
}

/// Free slot indices plus the wait queue of blocked acquirers.
struct FreeList {
    queue: ArrayQueue<u32>,
    lock: Mutex<()>,
    released: Condvar,
    counters: PoolCounters,
}

#[derive(Default)]
struct PoolCounters {
    acquired: AtomicU64,
    recycled: AtomicU64,
    exhausted: AtomicU64,
    waits: AtomicU64,
}

impl FreeList {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            released: Condvar::new(),
            counters: PoolCounters::default(),
        }
    }

    fn try_pop(&self) -> Option<u32> {
        let index = self.queue.pop();
        if index.is_some() {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        }
        index
    }

    fn pop_until(&self, deadline: Option<Instant>) -> Option<u32> {
        if let Some(index) = self.queue.pop() {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            return Some(index);
        }
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock.lock();
        loop {
            // Re-check under the lock: `push` notifies only after it enqueued.
            if let Some(index) = self.queue.pop() {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                return Some(index);
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut guard, deadline).timed_out() {
                        let index = self.queue.pop();
                        if index.is_some() {
                            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        }
                        return index;
                    }
                }
                None => self.released.wait(&mut guard),
            }
        }
    }

    fn push(&self, index: u32) {
        // Capacity equals the number of slots this list can ever own.
        let pushed = self.queue.push(index);
        debug_assert!(pushed.is_ok(), "free list overflow for slot {index}");
        let _guard = self.lock.lock();
        self.released.notify_one();
    }

    fn recycled(&self, index: u32) {
        self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        self.push(index);
    }

    fn stats(&self, total: usize) -> BufferPoolStats {
        BufferPoolStats {
            total,
            available: self.queue.len(),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
        }
    }
}

struct GlobalPool {
    arena: Arena,
    free: FreeList,
}

impl BufferRecycler for GlobalPool {
    fn arena(&self) -> &Arena {
        &self.arena
    }

    fn recycle(&self, index: u32) {
        self.free.recycled(index);
    }
}

/// A pool of preallocated, fixed-size buffers.
///
/// Cloning the pool is cheap and yields another handle to the same memory.
///
/// # Example
///
/// ```rust
/// use streamslice_core::buffer::{BufferPool, BufferPoolConfig, BufferProvider};
///
/// let pool = BufferPool::new(BufferPoolConfig::builder().buffer_size(128).num_buffers(1).build())?;
/// let buffer = pool.acquire_blocking();
/// assert!(pool.try_acquire().is_none()); // exhausted: apply backpressure
/// drop(buffer);
/// assert!(pool.try_acquire().is_some());
/// # Ok::<(), streamslice_core::buffer::BufferError>(())
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<GlobalPool>,
}

impl BufferPool {
    /// Preallocates every buffer described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] if the buffer size or count is
    /// zero, or the count does not fit a slot index.
    pub fn new(config: BufferPoolConfig) -> Result<Self, BufferError> {
        if config.buffer_size == 0 || config.num_buffers == 0 {
            return Err(BufferError::InvalidConfig(format!(
                "buffer_size ({}) and num_buffers ({}) must be non-zero",
                config.buffer_size, config.num_buffers
            )));
        }
        let count = u32::try_from(config.num_buffers).map_err(|_| {
            BufferError::InvalidConfig(format!(
                "num_buffers {} exceeds maximum {}",
                config.num_buffers,
                u32::MAX
            ))
        })?;

        let arena = Arena::new(config.buffer_size, config.num_buffers);
        let free = FreeList::with_capacity(config.num_buffers);
        for index in 0..count {
            free.push(index);
        }
        debug!(
            buffer_size = config.buffer_size,
            num_buffers = config.num_buffers,
            "buffer pool allocated"
        );

        Ok(Self {
            inner: Arc::new(GlobalPool { arena, free }),
        })
    }

    fn handle(&self, index: u32) -> Buffer {
        Buffer::prepare(Arc::clone(&self.inner) as Arc<dyn BufferRecycler>, index)
    }

    /// Reserves `count` buffers for exclusive use by a [`FixedSizeBufferPool`].
    ///
    /// Reserved buffers recycle to the sub-pool while it is alive and return
    /// to this pool once the sub-pool and every buffer it handed out are gone.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InsufficientBuffers`] if fewer than `count`
    /// buffers are free. Nothing is reserved in that case.
    pub fn create_fixed_size_pool(&self, count: usize) -> Result<FixedSizeBufferPool, BufferError> {
        let mut reserved = Vec::with_capacity(count);
        while reserved.len() < count {
            match self.inner.free.queue.pop() {
                Some(index) => reserved.push(index),
                None => {
                    let available = reserved.len();
                    for index in reserved {
                        self.inner.free.push(index);
                    }
                    return Err(BufferError::InsufficientBuffers {
                        requested: count,
                        available,
                    });
                }
            }
        }

        let free = FreeList::with_capacity(count);
        for index in reserved {
            free.push(index);
        }
        debug!(count, "reserved fixed-size buffer pool");
        Ok(FixedSizeBufferPool {
            inner: Arc::new(ReservedPool {
                parent: Arc::clone(&self.inner),
                free,
                capacity: count,
            }),
        })
    }

    /// Total number of buffers owned by the pool, including reserved ones.
    #[must_use]
    pub fn total_buffers(&self) -> usize {
        self.inner.arena.len()
    }

    /// Returns pool statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        self.inner.free.stats(self.total_buffers())
    }
}

impl BufferProvider for BufferPool {
    fn buffer_size(&self) -> usize {
        self.inner.arena.buffer_size()
    }

    fn acquire_blocking(&self) -> Buffer {
        let index = self
            .inner
            .free
            .pop_until(None)
            .unwrap_or_else(|| unreachable!("untimed wait returns a buffer"));
        self.handle(index)
    }

    fn try_acquire(&self) -> Option<Buffer> {
        self.inner.free.try_pop().map(|index| self.handle(index))
    }

    fn acquire_timeout(&self, timeout: Duration) -> Option<Buffer> {
        self.inner
            .free
            .pop_until(Some(Instant::now() + timeout))
            .map(|index| self.handle(index))
    }

    fn available_buffers(&self) -> usize {
        self.inner.free.queue.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size())
            .field("total", &self.total_buffers())
            .field("available", &self.available_buffers())
            .finish()
    }
}

struct ReservedPool {
    parent: Arc<GlobalPool>,
    free: FreeList,
    capacity: usize,
}

impl BufferRecycler for ReservedPool {
    fn arena(&self) -> &Arena {
        &self.parent.arena
    }

    fn recycle(&self, index: u32) {
        self.free.recycled(index);
    }
}

impl Drop for ReservedPool {
    // Runs once the sub-pool handle and every buffer it issued are gone.
    fn drop(&mut self) {
        let mut returned = 0usize;
        while let Some(index) = self.free.queue.pop() {
            self.parent.free.push(index);
            returned += 1;
        }
        debug!(returned, "fixed-size buffer pool released");
    }
}

/// A sub-pool holding a fixed reservation of buffers from a [`BufferPool`].
///
/// Operators use a reservation to bound their memory footprint: once the
/// reservation is exhausted, acquiring blocks (or fails fast) even if the
/// global pool still has free buffers.
#[derive(Clone)]
pub struct FixedSizeBufferPool {
    inner: Arc<ReservedPool>,
}

impl FixedSizeBufferPool {
    fn handle(&self, index: u32) -> Buffer {
        Buffer::prepare(Arc::clone(&self.inner) as Arc<dyn BufferRecycler>, index)
    }

    /// Number of buffers reserved by this sub-pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns sub-pool statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        self.inner.free.stats(self.inner.capacity)
    }
}

impl BufferProvider for FixedSizeBufferPool {
    fn buffer_size(&self) -> usize {
        self.inner.parent.arena.buffer_size()
    }

    fn acquire_blocking(&self) -> Buffer {
        let index = self
            .inner
            .free
            .pop_until(None)
            .unwrap_or_else(|| unreachable!("untimed wait returns a buffer"));
        self.handle(index)
    }

    fn try_acquire(&self) -> Option<Buffer> {
        self.inner.free.try_pop().map(|index| self.handle(index))
    }

    fn acquire_timeout(&self, timeout: Duration) -> Option<Buffer> {
        self.inner
            .free
            .pop_until(Some(Instant::now() + timeout))
            .map(|index| self.handle(index))
    }

    fn available_buffers(&self) -> usize {
        self.inner.free.queue.len()
    }
}

impl fmt::Debug for FixedSizeBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeBufferPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available_buffers())
            .finish()
    }
}

/// Buffer pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers owned by the pool.
    pub total: usize,
    /// Buffers currently on the free list.
    pub available: usize,
    /// Successful acquisitions.
    pub acquired: u64,
    /// Buffers returned after their last release.
    pub recycled: u64,
    /// Acquire attempts that found the pool empty.
    pub exhausted: u64,
    /// Acquisitions that had to wait for a release.
    pub waits: u64,
}

impl BufferPoolStats {
    /// Buffers currently handed out (or reserved by sub-pools).
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.available)
    }
}

impl fmt::Display for BufferPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferPool: {}/{} in use, acquired={}, recycled={}, exhausted={}, waits={}",
            self.in_use(),
            self.total,
            self.acquired,
            self.recycled,
            self.exhausted,
            self.waits
        )
    }
}
