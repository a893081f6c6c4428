//! Byte-level backends for the ledger log.
//!
//! A backend only stores frames; it never interprets them. The ledger owns
//! the frame format and recovery.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::error::{LedgerError, LedgerResult};

/// An append-only byte store holding the ledger log.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at
/// - `read_at` returns exactly the bytes previously written there
/// - after `sync` returns, everything appended so far survives a crash
pub trait LedgerBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::OutsideLog`] if the span passes the end of the
    /// log.
    fn read_at(&self, offset: u64, len: usize) -> LedgerResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> LedgerResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> LedgerResult<()>;

    /// Forces data and metadata to durable storage.
    fn sync(&mut self) -> LedgerResult<()>;

    /// Current size in bytes; the offset of the next append.
    fn size(&self) -> LedgerResult<u64>;

    /// Cuts the log back to `new_size` bytes.
    ///
    /// Recovery uses this to drop a torn tail.
    fn truncate(&mut self, new_size: u64) -> LedgerResult<()>;
}

/// The end of `len` bytes at `offset`, if the log of `size` bytes holds them.
pub(crate) fn span_end(offset: u64, len: usize, size: u64) -> LedgerResult<u64> {
    let end = offset.saturating_add(len as u64);
    if end > size {
        return Err(LedgerError::OutsideLog {
            start: offset,
            end,
            size,
        });
    }
    Ok(end)
}

/// Checks that a cut at `new_size` keeps a prefix of the log.
pub(crate) fn cut_point(new_size: u64, size: u64) -> LedgerResult<()> {
    span_end(new_size, 0, size).map(|_| ())
}
