//! File backend with an exclusive process lock.

use super::{cut_point, span_end, LedgerBackend};
use crate::error::{LedgerError, LedgerResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A ledger backend persisted in a single file.
///
/// Opening takes an advisory exclusive lock on the file, so only one process
/// writes a ledger at a time. The lock is released when the backend drops.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates the log at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Locked`] if another process holds the file, or
    /// an I/O error if it cannot be opened.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|_| LedgerError::Locked)?;

        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> LedgerResult<Vec<u8>> {
        span_end(offset, len, self.size)?;
        let mut frame = vec![0u8; len];
        if len > 0 {
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut frame)?;
        }
        Ok(frame)
    }

    fn append(&mut self, frames: &[u8]) -> LedgerResult<u64> {
        let at = self.size;
        if !frames.is_empty() {
            self.file.seek(SeekFrom::Start(at))?;
            self.file.write_all(frames)?;
            self.size = at + frames.len() as u64;
        }
        Ok(at)
    }

    fn flush(&mut self) -> LedgerResult<()> {
        Ok(self.file.flush()?)
    }

    fn sync(&mut self) -> LedgerResult<()> {
        Ok(self.file.sync_data()?)
    }

    fn size(&self) -> LedgerResult<u64> {
        Ok(self.size)
    }

    fn truncate(&mut self, new_size: u64) -> LedgerResult<()> {
        cut_point(new_size, self.size)?;
        // The cut must be on disk before a commit is appended after it.
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        self.size = new_size;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
