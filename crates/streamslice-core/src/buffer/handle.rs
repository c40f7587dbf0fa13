//! Buffer handles and the per-slot control block.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::time::{OriginId, SequenceData, Watermark};

/// Returns a slot to the free list it was acquired from.
pub(crate) trait BufferRecycler: Send + Sync {
    /// The arena that backs every slot this recycler hands out.
    fn arena(&self) -> &Arena;

    /// Called exactly once per acquire cycle, after the slot's count hit zero.
    fn recycle(&self, index: u32);
}

/// Preallocated memory blocks plus their control blocks.
pub(crate) struct Arena {
    slots: Box<[Slot]>,
    buffer_size: usize,
}

impl Arena {
    pub(crate) fn new(buffer_size: usize, num_buffers: usize) -> Self {
        let slots = (0..num_buffers).map(|_| Slot::new(buffer_size)).collect();
        Self { slots, buffer_size }
    }

    #[inline]
    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }
}

/// One memory block and the control block that guards it.
struct Slot {
    memory: UnsafeCell<Box<[u8]>>,
    refs: AtomicU32,
    generation: AtomicU32,
    tuple_count: AtomicU64,
    watermark: AtomicI64,
    origin: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU64,
    last_chunk: AtomicBool,
    creation_ts: AtomicI64,
}

// SAFETY: the memory cell is only handed out mutably through `Buffer::as_mut_slice`,
// which requires `&mut Buffer` and a reference count of exactly one, so no other
// handle (and therefore no other thread) can observe the slot at the same time.
// Shared access through `Buffer::as_slice` is read-only. Everything else is atomic.
#[allow(unsafe_code)]
unsafe impl Sync for Slot {}

impl Slot {
    fn new(buffer_size: usize) -> Self {
        Self {
            memory: UnsafeCell::new(vec![0u8; buffer_size].into_boxed_slice()),
            refs: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            tuple_count: AtomicU64::new(0),
            watermark: AtomicI64::new(Watermark::MIN.timestamp()),
            origin: AtomicU64::new(0),
            sequence_number: AtomicU64::new(0),
            chunk_number: AtomicU64::new(1),
            last_chunk: AtomicBool::new(true),
            creation_ts: AtomicI64::new(0),
        }
    }

    fn reset_metadata(&self) {
        self.tuple_count.store(0, Ordering::Relaxed);
        self.watermark
            .store(Watermark::MIN.timestamp(), Ordering::Relaxed);
        self.origin.store(0, Ordering::Relaxed);
        self.sequence_number.store(0, Ordering::Relaxed);
        self.chunk_number.store(1, Ordering::Relaxed);
        self.last_chunk.store(true, Ordering::Relaxed);
        self.creation_ts.store(0, Ordering::Relaxed);
    }
}

/// A reference-counted handle to one pooled memory block.
///
/// Handles are created by a pool's acquire methods with a reference count of
/// exactly one. [`Buffer::retain`] (or `clone`) adds a reference that aliases
/// the same memory; dropping a handle releases its reference. The memory goes
/// back to the pool when the last handle is dropped.
///
/// Each handle remembers the slot generation it was issued for and validates
/// it on every access, so a handle can never observe a recycled slot.
pub struct Buffer {
    owner: Arc<dyn BufferRecycler>,
    index: u32,
    generation: u32,
}

impl Buffer {
    /// Hands out the slot at `index` with a fresh reference count of one.
    ///
    /// # Panics
    ///
    /// Panics if the slot still has live references. A free-listed slot with
    /// a non-zero count means a release was double counted somewhere.
    pub(crate) fn prepare(owner: Arc<dyn BufferRecycler>, index: u32) -> Self {
        let slot = owner.arena().slot(index);
        let prepared = slot
            .refs
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        assert!(
            prepared.is_ok(),
            "buffer slot {index} handed out with {} live references",
            prepared.unwrap_or_else(|refs| refs)
        );
        let generation = slot.generation.load(Ordering::Acquire);
        Self {
            owner,
            index,
            generation,
        }
    }

    #[inline]
    fn slot(&self) -> &Slot {
        let slot = self.owner.arena().slot(self.index);
        assert_eq!(
            slot.generation.load(Ordering::Acquire),
            self.generation,
            "stale handle to buffer slot {}",
            self.index
        );
        slot
    }

    /// Adds a reference and returns another handle to the same memory.
    #[must_use]
    pub fn retain(&self) -> Buffer {
        self.clone()
    }

    /// Releases this handle's reference.
    ///
    /// Equivalent to dropping the handle. The memory is recycled when the
    /// last reference is released.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live handles aliasing this buffer's memory.
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.slot().refs.load(Ordering::Acquire)
    }

    /// Index of the backing slot within its pool.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.owner.arena().buffer_size()
    }

    /// Read-only view of the buffer memory.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let slot = self.slot();
        // SAFETY: writers need `&mut self` plus a reference count of one (see
        // `as_mut_slice`), which excludes every other handle for as long as the
        // returned borrow lives. This borrow is tied to `&self`, so it cannot
        // overlap a mutable borrow through the same handle either.
        #[allow(unsafe_code)]
        unsafe {
            &*slot.memory.get()
        }
    }

    /// Mutable view of the buffer memory.
    ///
    /// Returns `None` once the buffer has been retained: shared buffers are
    /// read-only.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let slot = self.slot();
        if slot.refs.load(Ordering::Acquire) != 1 {
            return None;
        }
        // SAFETY: this handle is the only reference to the slot and we hold it
        // mutably, so no other borrow of the memory can exist. A new handle can
        // only be created through `retain`, which needs `&self`.
        #[allow(unsafe_code)]
        unsafe {
            Some(&mut *slot.memory.get())
        }
    }

    /// Number of tuples stored in the buffer.
    #[must_use]
    pub fn tuple_count(&self) -> u64 {
        self.slot().tuple_count.load(Ordering::Acquire)
    }

    /// Sets the number of tuples stored in the buffer.
    pub fn set_tuple_count(&self, count: u64) {
        self.slot().tuple_count.store(count, Ordering::Release);
    }

    /// Watermark carried by the buffer.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.slot().watermark.load(Ordering::Acquire))
    }

    /// Sets the watermark carried by the buffer.
    pub fn set_watermark(&self, watermark: Watermark) {
        self.slot()
            .watermark
            .store(watermark.timestamp(), Ordering::Release);
    }

    /// Origin (input stream) that produced the buffer.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        OriginId(self.slot().origin.load(Ordering::Acquire))
    }

    /// Sets the origin of the buffer.
    pub fn set_origin(&self, origin: OriginId) {
        self.slot().origin.store(origin.0, Ordering::Release);
    }

    /// Sequence number, chunk number and last-chunk flag of the buffer.
    #[must_use]
    pub fn sequence_data(&self) -> SequenceData {
        let slot = self.slot();
        SequenceData {
            sequence_number: slot.sequence_number.load(Ordering::Acquire),
            chunk_number: slot.chunk_number.load(Ordering::Acquire),
            last_chunk: slot.last_chunk.load(Ordering::Acquire),
        }
    }

    /// Sets the sequence number, chunk number and last-chunk flag.
    pub fn set_sequence_data(&self, data: SequenceData) {
        let slot = self.slot();
        slot.sequence_number
            .store(data.sequence_number, Ordering::Release);
        slot.chunk_number.store(data.chunk_number, Ordering::Release);
        slot.last_chunk.store(data.last_chunk, Ordering::Release);
    }

    /// Sequence number of the buffer.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.slot().sequence_number.load(Ordering::Acquire)
    }

    /// Ingestion timestamp set by the producer.
    #[must_use]
    pub fn creation_timestamp(&self) -> i64 {
        self.slot().creation_ts.load(Ordering::Acquire)
    }

    /// Sets the ingestion timestamp.
    pub fn set_creation_timestamp(&self, ts: i64) {
        self.slot().creation_ts.store(ts, Ordering::Release);
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let previous = self.slot().refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "retain on a released buffer");
        Self {
            owner: Arc::clone(&self.owner),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let slot = self.slot();
        let previous = slot.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous != 0,
            "buffer slot {} released more times than it was retained",
            self.index
        );
        if previous == 1 {
            slot.reset_metadata();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            self.owner.recycle(self.index);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("capacity", &self.capacity())
            .field("tuple_count", &self.tuple_count())
            .field("refs", &self.reference_count())
            .finish()
    }
}
