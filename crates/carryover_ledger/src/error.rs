//! Error types for ledger operations.

use crate::record::{RecordId, RecordStatus};
use std::io;
use thiserror::Error;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while reading or writing the migration ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An I/O error occurred in the backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame span or cut point lies past the bytes the log holds.
    #[error("log span {start}..{end} lies outside the {size}-byte log")]
    OutsideLog {
        /// First byte of the span.
        start: u64,
        /// One past the last byte of the span.
        end: u64,
        /// Bytes the log holds.
        size: u64,
    },

    /// The log contains a frame that cannot be decoded.
    #[error("ledger corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A record payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another process holds the ledger file lock.
    #[error("ledger locked: another process has exclusive access")]
    Locked,

    /// A row or key lock is held by another transaction.
    #[error("lock contention on {target}")]
    LockContention {
        /// Human-readable lock target.
        target: String,
    },

    /// A transaction kept hitting lock contention until its retry budget ran out.
    #[error("transaction retry budget exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last contention error seen.
        last: String,
    },

    /// No record exists with the given id.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// A status change that the record state machine does not allow.
    #[error("invalid transition for {record}: {from} -> {to}")]
    InvalidTransition {
        /// The record being updated.
        record: RecordId,
        /// Current status.
        from: RecordStatus,
        /// Requested status.
        to: RecordStatus,
    },

    /// An update was attempted on a row the transaction has not locked.
    #[error("record {0} is not locked by this transaction")]
    NotLocked(RecordId),

    /// The transaction was already committed or aborted.
    #[error("transaction is no longer active")]
    TransactionClosed,
}

impl LedgerError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a lock contention error.
    pub fn contention(target: impl Into<String>) -> Self {
        Self::LockContention {
            target: target.into(),
        }
    }

    /// Returns true if retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_retryable_marker() {
        assert!(LedgerError::contention("rec:1").is_contention());
        assert!(!LedgerError::Locked.is_contention());
        assert!(!LedgerError::RetryExhausted {
            attempts: 3,
            last: "x".into()
        }
        .is_contention());
    }

    #[test]
    fn error_display() {
        let err = LedgerError::InvalidTransition {
            record: RecordId::new(7),
            from: RecordStatus::Success,
            to: RecordStatus::Failed,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for rec:7: success -> failed"
        );
    }
}
