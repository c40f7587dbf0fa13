//! Single-origin watermark processor over a circular log of tagged slots.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::{Backoff, CachePadded};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use super::{LogOverflowPolicy, OriginId, SequenceData, Watermark, WatermarkConfig, WatermarkError};

/// Slot tag: nothing published.
const EMPTY: u64 = u64::MAX;
/// Slot tag: a writer has claimed the slot and is storing its timestamp.
const WRITING: u64 = u64::MAX - 1;

struct LogSlot {
    sequence: AtomicU64,
    timestamp: AtomicI64,
}

impl LogSlot {
    fn empty() -> Self {
        Self {
            sequence: AtomicU64::new(EMPTY),
            timestamp: AtomicI64::new(i64::MIN),
        }
    }
}

#[derive(Debug, Default)]
struct PendingChunks {
    seen: FxHashSet<u64>,
    last: Option<u64>,
    max_timestamp: Option<i64>,
    /// All chunks arrived; kept until the log consumes the sequence so late
    /// duplicates are still recognised.
    complete: bool,
}

/// Tracks the watermark of one origin from out-of-order updates.
///
/// Each update carries a sequence number. The update is written into the log
/// slot `sequence % log_size`, tagged with its sequence number. Whichever
/// thread finds the slot for the next expected sequence filled claims it with
/// a compare-and-swap on the log position, folds its timestamp into the
/// watermark and frees the slot. The watermark therefore only reflects
/// contiguous prefixes of the sequence and never decreases.
///
/// Updates never overwrite a slot that has not been consumed: a sequence
/// number at least `log_size` ahead of the log position is rejected or waits
/// for the gap to close, depending on [`LogOverflowPolicy`].
pub struct WatermarkProcessor {
    origin: OriginId,
    log: Box<[LogSlot]>,
    next_sequence: CachePadded<AtomicU64>,
    watermark: CachePadded<AtomicI64>,
    pending_chunks: Mutex<FxHashMap<u64, PendingChunks>>,
    overflow_policy: LogOverflowPolicy,
}

impl WatermarkProcessor {
    /// Creates a processor for the default origin.
    #[must_use]
    pub fn new(config: WatermarkConfig) -> Self {
        Self::for_origin(OriginId::default(), config)
    }

    /// Creates a processor for `origin`.
    #[must_use]
    pub fn for_origin(origin: OriginId, config: WatermarkConfig) -> Self {
        Self::restored(origin, config, Watermark::MIN, config.initial_sequence)
    }

    /// Creates a processor that resumes at `next_sequence` with `watermark`.
    #[must_use]
    pub fn restored(
        origin: OriginId,
        config: WatermarkConfig,
        watermark: Watermark,
        next_sequence: u64,
    ) -> Self {
        let log = (0..config.log_size.max(1)).map(|_| LogSlot::empty()).collect();
        Self {
            origin,
            log,
            next_sequence: CachePadded::new(AtomicU64::new(next_sequence)),
            watermark: CachePadded::new(AtomicI64::new(watermark.timestamp())),
            pending_chunks: Mutex::new(FxHashMap::default()),
            overflow_policy: config.overflow_policy,
        }
    }

    /// Applies one update and returns the current watermark.
    ///
    /// The returned watermark may be unchanged when earlier sequence numbers
    /// are still outstanding, or when `sequence` is a chunk and other chunks
    /// of the same sequence number have not been seen yet. A chunked sequence
    /// contributes the largest watermark among its chunks.
    ///
    /// # Errors
    ///
    /// - [`WatermarkError::SequenceRegression`] if `sequence` was already
    ///   applied or is being applied by another caller
    /// - [`WatermarkError::SequenceGapExceedsLog`] if `sequence` is too far
    ///   ahead of the log position and the overflow policy gives up
    /// - [`WatermarkError::DuplicateChunk`] if a chunk number repeats, is 0,
    ///   or lies beyond the chunk flagged as last
    pub fn update(
        &self,
        watermark: Watermark,
        sequence: SequenceData,
    ) -> Result<Watermark, WatermarkError> {
        let seq = sequence.sequence_number;
        self.check_regression(seq)?;

        let timestamp = if sequence.is_chunked() {
            match self.record_chunk(sequence, watermark.timestamp())? {
                Some(timestamp) => timestamp,
                None => return Ok(self.current_watermark()),
            }
        } else {
            watermark.timestamp()
        };

        self.wait_for_capacity(seq)?;
        self.publish(seq, timestamp)?;
        self.advance();
        Ok(self.current_watermark())
    }

    fn check_regression(&self, seq: u64) -> Result<u64, WatermarkError> {
        let expected = self.next_sequence.load(Ordering::SeqCst);
        if seq < expected || seq >= WRITING {
            return Err(WatermarkError::SequenceRegression {
                origin: self.origin,
                sequence: seq,
                expected,
            });
        }
        Ok(expected)
    }

    fn record_chunk(
        &self,
        sequence: SequenceData,
        timestamp: i64,
    ) -> Result<Option<i64>, WatermarkError> {
        let seq = sequence.sequence_number;
        let chunk = sequence.chunk_number;
        let duplicate = WatermarkError::DuplicateChunk {
            origin: self.origin,
            sequence: seq,
            chunk,
        };

        let mut pending = self.pending_chunks.lock();
        let expected = self.next_sequence.load(Ordering::SeqCst);
        pending.retain(|&pending_seq, _| pending_seq >= expected);
        if seq < expected {
            return Err(WatermarkError::SequenceRegression {
                origin: self.origin,
                sequence: seq,
                expected,
            });
        }

        let entry = pending.entry(seq).or_default();
        let beyond_last = entry.last.is_some_and(|last| chunk > last);
        let last_below_seen =
            sequence.last_chunk && entry.seen.iter().any(|&seen| seen > chunk);
        if entry.complete
            || chunk < SequenceData::INITIAL_CHUNK_NUMBER
            || beyond_last
            || last_below_seen
            || (sequence.last_chunk && entry.last.is_some())
            || !entry.seen.insert(chunk)
        {
            if entry.seen.is_empty() {
                pending.remove(&seq);
            }
            return Err(duplicate);
        }

        entry.max_timestamp = Some(entry.max_timestamp.map_or(timestamp, |ts| ts.max(timestamp)));
        if sequence.last_chunk {
            entry.last = Some(chunk);
        }
        // Chunk numbers are distinct and within 1..=last, so the count decides.
        let done = entry.last == Some(entry.seen.len() as u64);
        if done {
            entry.complete = true;
        }
        Ok(done.then(|| entry.max_timestamp.unwrap_or(timestamp)))
    }

    fn wait_for_capacity(&self, seq: u64) -> Result<(), WatermarkError> {
        let log_size = self.log.len() as u64;
        let backoff = Backoff::new();
        let mut deadline = None;
        loop {
            let expected = self.check_regression(seq)?;
            let gap = seq - expected;
            if gap < log_size {
                return Ok(());
            }
            let overflow = WatermarkError::SequenceGapExceedsLog {
                origin: self.origin,
                sequence: seq,
                expected,
                gap,
                log_size: self.log.len(),
            };
            match self.overflow_policy {
                LogOverflowPolicy::Reject => return Err(overflow),
                LogOverflowPolicy::SpinWait { timeout } => {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    if Instant::now() >= deadline {
                        return Err(overflow);
                    }
                    backoff.snooze();
                }
            }
        }
    }

    fn slot(&self, seq: u64) -> &LogSlot {
        // The modulus is below `log.len()`, which is a usize.
        #[allow(clippy::cast_possible_truncation)]
        let index = (seq % self.log.len() as u64) as usize;
        &self.log[index]
    }

    fn publish(&self, seq: u64, timestamp: i64) -> Result<(), WatermarkError> {
        let slot = self.slot(seq);
        let backoff = Backoff::new();
        loop {
            match slot
                .sequence
                .compare_exchange(EMPTY, WRITING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                // The previous occupant was consumed and is about to be freed.
                Err(occupant) if occupant != WRITING && occupant < seq => backoff.snooze(),
                Err(_) => {
                    return Err(WatermarkError::SequenceRegression {
                        origin: self.origin,
                        sequence: seq,
                        expected: self.next_sequence.load(Ordering::SeqCst),
                    })
                }
            }
        }
        slot.timestamp.store(timestamp, Ordering::SeqCst);
        slot.sequence.store(seq, Ordering::SeqCst);
        Ok(())
    }

    fn advance(&self) {
        loop {
            let next = self.next_sequence.load(Ordering::SeqCst);
            let slot = self.slot(next);
            if slot.sequence.load(Ordering::SeqCst) != next {
                return;
            }
            let timestamp = slot.timestamp.load(Ordering::SeqCst);
            if self
                .next_sequence
                .compare_exchange(next, next + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.watermark.fetch_max(timestamp, Ordering::SeqCst);
                slot.sequence.store(EMPTY, Ordering::SeqCst);
            }
        }
    }

    /// Returns the current watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        Watermark::new(self.watermark.load(Ordering::SeqCst))
    }

    /// Returns the next sequence number the processor is waiting for.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Returns the origin this processor tracks.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Returns the number of slots in the log.
    #[must_use]
    pub fn log_size(&self) -> usize {
        self.log.len()
    }

    /// Returns the number of sequence numbers with chunks still outstanding.
    #[must_use]
    pub fn pending_chunked_sequences(&self) -> usize {
        self.pending_chunks
            .lock()
            .values()
            .filter(|chunks| !chunks.complete)
            .count()
    }
}

impl fmt::Debug for WatermarkProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkProcessor")
            .field("origin", &self.origin)
            .field("watermark", &self.current_watermark())
            .field("next_sequence", &self.next_sequence())
            .field("log_size", &self.log.len())
            .finish_non_exhaustive()
    }
}
