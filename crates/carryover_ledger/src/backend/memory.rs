//! In-memory backend for tests and ephemeral runs.

use super::{cut_point, span_end, LedgerBackend};
use crate::error::LedgerResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// A ledger backend that keeps the log in memory.
///
/// Clones share the same buffer, which lets a test "crash" a ledger by
/// dropping it and reopen a new one over the surviving bytes.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend over existing log bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the log bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Drops the last `bytes` bytes, simulating a write torn by a crash.
    pub fn tear_tail(&self, bytes: usize) {
        let mut data = self.data.write();
        let keep = data.len().saturating_sub(bytes);
        data.truncate(keep);
    }
}

impl LedgerBackend for MemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> LedgerResult<Vec<u8>> {
        let data = self.data.read();
        span_end(offset, len, data.len() as u64)?;
        // The span is inside `data`, so both ends fit in usize.
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> LedgerResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> LedgerResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> LedgerResult<()> {
        Ok(())
    }

    fn size(&self) -> LedgerResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> LedgerResult<()> {
        let mut data = self.data.write();
        cut_point(new_size, data.len() as u64)?;
        data.truncate(new_size as usize);
        Ok(())
    }
}
