//! Spill files for paged partitions.
//!
//! A spill file holds the pages of one partition, written and read
//! sequentially. Each page is framed as
//!
//! ```text
//! +----------------+-------------------------------------+
//! | count: u32 LE  | count * record_size bytes of records|
//! +----------------+-------------------------------------+
//! ```
//!
//! The layout is internal to one process: files are removed once they are
//! read back or their owner is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

static NEXT_SPILL_ID: AtomicU64 = AtomicU64::new(0);

/// Errors from spilling partitions to disk.
#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    /// IO error while writing or reading a spill file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A spill file ended in the middle of a page.
    #[error("corrupted spill page at offset {offset} in {}", path.display())]
    Corrupted {
        /// The spill file.
        path: PathBuf,
        /// Byte offset of the truncated page frame.
        offset: u64,
    },
}

/// Configuration for spilling paged partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillConfig {
    /// Spill partitions when the page pool is exhausted.
    pub enabled: bool,
    /// Directory receiving spill files.
    pub directory: PathBuf,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: std::env::temp_dir().join("streamslice-spill"),
        }
    }
}

impl SpillConfig {
    /// Enabled spilling into `directory`.
    #[must_use]
    pub fn enabled(directory: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            directory: directory.into(),
        }
    }
}

/// A spill file and the number of records it holds.
///
/// The file is deleted when the run is dropped.
#[derive(Debug)]
pub(crate) struct SpilledRun {
    path: PathBuf,
    record_size: usize,
    records: usize,
}

impl SpilledRun {
    /// Writes `pages` (record count plus record bytes) to a new file in `directory`.
    pub(crate) fn write<'a>(
        directory: &Path,
        record_size: usize,
        pages: impl IntoIterator<Item = (u32, &'a [u8])>,
    ) -> Result<Self, SpillError> {
        fs::create_dir_all(directory)?;
        let id = NEXT_SPILL_ID.fetch_add(1, Ordering::Relaxed);
        let path = directory.join(format!("slice-{}-{id}.spill", std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut run = Self {
            path,
            record_size,
            records: 0,
        };

        let mut writer = BufWriter::new(file);
        for (count, bytes) in pages {
            debug_assert_eq!(bytes.len(), count as usize * record_size);
            writer.write_all(&count.to_le_bytes())?;
            writer.write_all(bytes)?;
            run.records += count as usize;
        }
        writer.flush()?;

        debug!(path = %run.path.display(), records = run.records, "spilled partition");
        Ok(run)
    }

    /// Number of records in the file.
    pub(crate) fn records(&self) -> usize {
        self.records
    }

    /// Reads every page back in order, handing each page's records to `on_page`.
    pub(crate) fn read<E>(
        &self,
        mut on_page: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<SpillError>,
    {
        let file = File::open(&self.path).map_err(SpillError::from)?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        let mut page = Vec::new();
        loop {
            let mut count_bytes = [0u8; 4];
            match reader.read_exact(&mut count_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(SpillError::from(e).into()),
            }
            let count = u32::from_le_bytes(count_bytes) as usize;
            page.resize(count * self.record_size, 0);
            if let Err(e) = reader.read_exact(&mut page) {
                return Err(if e.kind() == ErrorKind::UnexpectedEof {
                    SpillError::Corrupted {
                        path: self.path.clone(),
                        offset,
                    }
                } else {
                    SpillError::from(e)
                }
                .into());
            }
            offset += 4 + page.len() as u64;
            on_page(&page)?;
        }
    }
}

impl Drop for SpilledRun {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove spill file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_pages() {
        let dir = tempfile::tempdir().unwrap();
        let first = [1u8, 1, 2, 2];
        let second = [3u8, 3];
        let run = SpilledRun::write(dir.path(), 2, [(2, &first[..]), (1, &second[..])]).unwrap();
        assert_eq!(run.records(), 3);

        let mut pages = Vec::new();
        run.read::<SpillError>(|page| {
            pages.push(page.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(pages, vec![first.to_vec(), second.to_vec()]);
    }

    #[test]
    fn test_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let run = SpilledRun::write(dir.path(), 1, [(1, &[9u8][..])]).unwrap();
        let path = run.path.clone();
        assert!(path.exists());
        drop(run);
        assert!(!path.exists());
    }

    #[test]
    fn test_truncated_page_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let run = SpilledRun::write(dir.path(), 4, [(2, &[0u8; 8][..])]).unwrap();
        let bytes = fs::read(&run.path).unwrap();
        fs::write(&run.path, &bytes[..bytes.len() - 3]).unwrap();

        let result = run.read::<SpillError>(|_| Ok(()));
        assert!(matches!(result, Err(SpillError::Corrupted { offset: 0, .. })));
    }
}
