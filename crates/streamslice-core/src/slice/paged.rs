//! Append-only collections of fixed-size records backed by pooled pages.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::buffer::{Buffer, BufferProvider};

use super::spill::{SpillError, SpilledRun};
use super::SliceError;

/// An append-only sequence of fixed-size records stored in pooled buffers.
///
/// Every page is a [`Buffer`] drawn from a [`BufferProvider`]; the buffer's
/// tuple count records how many records the page holds. Pages are owned
/// exclusively by the vector, so they stay writable until the vector is
/// dropped and the buffers recycle.
///
/// Records can be moved to a spill file with [`PagedVector::spill`] and
/// brought back with [`PagedVector::reload`]. Spilled records count towards
/// [`PagedVector::len`] but are not visited by [`PagedVector::iter`].
pub struct PagedVector {
    provider: Arc<dyn BufferProvider>,
    record_size: usize,
    records_per_page: usize,
    pages: Vec<Buffer>,
    in_memory: usize,
    spilled: Vec<SpilledRun>,
}

impl PagedVector {
    /// Creates an empty vector of `record_size`-byte records.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::InvalidRecordSize`] if `record_size` is zero or
    /// larger than one page.
    pub fn new(provider: Arc<dyn BufferProvider>, record_size: usize) -> Result<Self, SliceError> {
        let page_size = provider.buffer_size();
        if record_size == 0 || record_size > page_size {
            return Err(SliceError::InvalidRecordSize {
                record_size,
                page_size,
            });
        }
        Ok(Self {
            provider,
            record_size,
            records_per_page: page_size / record_size,
            pages: Vec::new(),
            in_memory: 0,
            spilled: Vec::new(),
        })
    }

    /// Appends a record, waiting for a page if the provider is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::RecordSizeMismatch`] if `record` has the wrong length.
    pub fn append(&mut self, record: &[u8]) -> Result<(), SliceError> {
        self.append_with(record, |provider| Some(provider.acquire_blocking()))
    }

    /// Appends a record without waiting for a page.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::PagesExhausted`] if a new page is needed and the
    /// provider has none free, and [`SliceError::RecordSizeMismatch`] if
    /// `record` has the wrong length.
    pub fn try_append(&mut self, record: &[u8]) -> Result<(), SliceError> {
        self.append_with(record, |provider| provider.try_acquire())
    }

    fn append_with(
        &mut self,
        record: &[u8],
        acquire: impl FnOnce(&dyn BufferProvider) -> Option<Buffer>,
    ) -> Result<(), SliceError> {
        if record.len() != self.record_size {
            return Err(SliceError::RecordSizeMismatch {
                expected: self.record_size,
                actual: record.len(),
            });
        }

        let last_full = self
            .pages
            .last()
            .map_or(true, |page| Self::page_len(page) >= self.records_per_page);
        if last_full {
            let page = acquire(self.provider.as_ref()).ok_or(SliceError::PagesExhausted)?;
            self.pages.push(page);
        }

        let last = self.pages.len() - 1;
        let page = &mut self.pages[last];
        let count = Self::page_len(page);
        let offset = count * self.record_size;
        let memory = page.as_mut_slice().ok_or(SliceError::SharedPage)?;
        memory[offset..offset + self.record_size].copy_from_slice(record);
        page.set_tuple_count(count as u64 + 1);
        self.in_memory += 1;
        Ok(())
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn page_len(page: &Buffer) -> usize {
        page.tuple_count() as usize
    }

    /// Moves every record of `other` to the end of this vector.
    ///
    /// Pages change owner; no record is copied.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::RecordSizeMismatch`] if the record sizes differ.
    pub fn append_all(&mut self, mut other: PagedVector) -> Result<(), SliceError> {
        if other.record_size != self.record_size {
            return Err(SliceError::RecordSizeMismatch {
                expected: self.record_size,
                actual: other.record_size,
            });
        }
        self.pages.append(&mut other.pages);
        self.spilled.append(&mut other.spilled);
        self.in_memory += other.in_memory;
        Ok(())
    }

    /// The provider pages are drawn from.
    pub(crate) fn provider(&self) -> &Arc<dyn BufferProvider> {
        &self.provider
    }

    /// Adds an empty page acquired by the caller; the next append writes into it.
    pub(crate) fn push_page(&mut self, page: Buffer) {
        debug_assert_eq!(page.tuple_count(), 0);
        self.pages.push(page);
    }

    /// Moves the records out, leaving an empty vector on the same provider.
    pub(crate) fn take(&mut self) -> PagedVector {
        let empty = PagedVector {
            provider: Arc::clone(&self.provider),
            record_size: self.record_size,
            records_per_page: self.records_per_page,
            pages: Vec::new(),
            in_memory: 0,
            spilled: Vec::new(),
        };
        std::mem::replace(self, empty)
    }

    /// Iterates over the in-memory records in append order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let record_size = self.record_size;
        self.pages.iter().flat_map(move |page| {
            page.as_slice()[..Self::page_len(page) * record_size].chunks_exact(record_size)
        })
    }

    /// Total number of records, including spilled ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_memory + self.spilled_records()
    }

    /// Whether the vector holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records currently in spill files.
    #[must_use]
    pub fn spilled_records(&self) -> usize {
        self.spilled.iter().map(SpilledRun::records).sum()
    }

    /// Size of one record in bytes.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of pooled pages held.
    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Writes the in-memory records to a spill file in `directory` and
    /// releases their pages.
    ///
    /// Returns the number of records spilled.
    ///
    /// # Errors
    ///
    /// Returns [`SpillError`] if the file cannot be written. The records stay
    /// in memory in that case.
    pub fn spill(&mut self, directory: &Path) -> Result<usize, SpillError> {
        if self.pages.is_empty() {
            return Ok(0);
        }
        let record_size = self.record_size;
        let run = SpilledRun::write(
            directory,
            record_size,
            self.pages.iter().map(|page| {
                let count = Self::page_len(page);
                #[allow(clippy::cast_possible_truncation)]
                let frame_count = count as u32;
                (frame_count, &page.as_slice()[..count * record_size])
            }),
        )?;
        let spilled = run.records();
        self.pages.clear();
        self.in_memory = 0;
        self.spilled.push(run);
        Ok(spilled)
    }

    /// Reads spilled records back into pages, ahead of the records that
    /// stayed in memory, and deletes the spill files.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Spill`] if a spill file cannot be read. The
    /// vector is left as it was, spill files included, so the reload can be
    /// retried.
    pub fn reload(&mut self) -> Result<(), SliceError> {
        if self.spilled.is_empty() {
            return Ok(());
        }
        let runs = std::mem::take(&mut self.spilled);
        let resident = std::mem::take(&mut self.pages);
        let resident_records = std::mem::replace(&mut self.in_memory, 0);

        let record_size = self.record_size;
        let reloaded = runs.iter().try_for_each(|run| {
            run.read::<SliceError>(|page| {
                page.chunks_exact(record_size)
                    .try_for_each(|record| self.append(record))
            })
        });
        if let Err(e) = reloaded {
            // Partially reloaded pages go back to the pool.
            self.pages = resident;
            self.in_memory = resident_records;
            self.spilled = runs;
            return Err(e);
        }
        self.pages.extend(resident);
        self.in_memory += resident_records;
        Ok(())
    }
}

impl fmt::Debug for PagedVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedVector")
            .field("record_size", &self.record_size)
            .field("records", &self.in_memory)
            .field("pages", &self.pages.len())
            .field("spilled", &self.spilled_records())
            .finish()
    }
}
