//! # Carryover Ledger
//!
//! Durable, crash-safe store of per-item migration records.
//!
//! Every source entity a migration touches gets a [`MigrationRecord`]. A
//! record starts `pending` and moves exactly once to `success`, `failed` or
//! `skipped`. Records are never deleted and never change after reaching a
//! terminal status.
//!
//! ## Design
//!
//! - Append-only log of `Begin`/`Put`/`Commit` frames, CBOR payloads, CRC32
//! - Recovery replays committed transactions and cuts a torn tail
//! - Row and key locks taken without waiting; contention retries the whole
//!   transaction with backoff, then fails with [`LedgerError::RetryExhausted`]
//! - One writer process per log file (advisory file lock)
//!
//! ## Example
//!
//! ```rust
//! use carryover_ledger::{EntityKind, Ledger, NewRecord, Outcome, OwnerId, SystemId};
//!
//! let ledger = Ledger::in_memory();
//! let record = ledger
//!     .insert_pending(NewRecord::staged(
//!         OwnerId::new("acme"),
//!         EntityKind::Coupon,
//!         SystemId::new("legacy"),
//!         "c-1",
//!         Some("SAVE10".into()),
//!     ))
//!     .unwrap();
//!
//! ledger
//!     .transaction(|txn| {
//!         let mut locked = txn.lock(record.id)?;
//!         locked.apply(Outcome::success("d-1"), chrono::Utc::now())?;
//!         txn.update(locked)
//!     })
//!     .unwrap();
//!
//! assert!(ledger.get(record.id).unwrap().is_terminal());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod error;
mod log;
mod query;
mod record;
mod store;
mod txn;

pub use backend::{FileBackend, LedgerBackend, MemoryBackend};
pub use config::{LedgerConfig, RetryConfig};
pub use error::{LedgerError, LedgerResult};
pub use log::{compute_crc32, Frame, TxnId, LOG_MAGIC, LOG_VERSION};
pub use query::{DestinationFilter, EntityFilter, RecordQuery};
pub use record::{
    ClaimMarker, EntityKind, MigrationRecord, NewRecord, Outcome, OwnerId, RecordId, RecordKey,
    RecordStatus, RunId, SystemId,
};
pub use store::{Ledger, LedgerStats, RecoveryInfo, StatusCounts, VerifyReport, Violation};
pub use txn::LedgerTxn;
