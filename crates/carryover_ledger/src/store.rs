//! The migration ledger: committed state, recovery and transactions.

use crate::backend::{FileBackend, LedgerBackend, MemoryBackend};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::log::{self, TxnId};
use crate::query::RecordQuery;
use crate::record::{
    EntityKind, MigrationRecord, NewRecord, OwnerId, RecordId, RecordKey, RecordStatus, SystemId,
};
use crate::txn::{LedgerTxn, LockTable};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

type Partition = (OwnerId, EntityKind, SystemId);

/// Committed records plus a per-(owner, kind, source) index.
#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    records: BTreeMap<RecordId, MigrationRecord>,
    partitions: HashMap<Partition, BTreeSet<RecordId>>,
    /// Commits that moved a record of the kind to `success`.
    successes: HashMap<EntityKind, u64>,
}

impl LedgerState {
    fn from_records(records: BTreeMap<RecordId, MigrationRecord>) -> Self {
        let mut state = Self::default();
        for record in records.into_values() {
            state.put(record);
        }
        state
    }

    pub(crate) fn put(&mut self, record: MigrationRecord) {
        let newly_succeeded = record.status == RecordStatus::Success
            && self
                .records
                .get(&record.id)
                .map_or(true, |old| old.status != RecordStatus::Success);
        if newly_succeeded {
            *self.successes.entry(record.kind).or_default() += 1;
        }
        let partition = (record.owner.clone(), record.kind, record.source_system.clone());
        self.partitions.entry(partition).or_default().insert(record.id);
        self.records.insert(record.id, record);
    }

    pub(crate) fn get(&self, id: RecordId) -> Option<&MigrationRecord> {
        self.records.get(&id)
    }

    /// IDs worth checking against `query`: its partition when the query
    /// pins one, every record otherwise.
    pub(crate) fn candidate_ids(&self, query: &RecordQuery) -> BTreeSet<RecordId> {
        match query.partition() {
            Some((owner, kind, source)) => self
                .partitions
                .get(&(owner.clone(), kind, source.clone()))
                .cloned()
                .unwrap_or_default(),
            None => self.records.keys().copied().collect(),
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Pending records.
    pub pending: usize,
    /// Successful records.
    pub success: usize,
    /// Failed records.
    pub failed: usize,
    /// Skipped records.
    pub skipped: usize,
}

impl StatusCounts {
    fn add(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Pending => self.pending += 1,
            RecordStatus::Success => self.success += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Skipped => self.skipped += 1,
        }
    }

    /// Sum of all counts.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.success + self.failed + self.skipped
    }
}

/// Ledger-wide counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    /// Number of records.
    pub records: usize,
    /// Counts for all kinds together.
    pub totals: StatusCounts,
    /// Counts per entity kind.
    pub by_kind: BTreeMap<EntityKind, StatusCounts>,
}

/// A broken ledger invariant found by [`Ledger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    /// More than one success/failed record for the same key.
    DuplicateCanonical {
        /// The key.
        key: RecordKey,
        /// The competing records.
        records: Vec<RecordId>,
    },
    /// A skipped record without a canonical back-reference.
    MissingCanonical {
        /// The skipped record.
        record: RecordId,
    },
    /// A skipped record whose canonical record does not exist.
    DanglingCanonical {
        /// The skipped record.
        record: RecordId,
        /// The missing canonical ID.
        canonical: RecordId,
    },
    /// A successful record without a destination entity.
    MissingDestination {
        /// The record.
        record: RecordId,
    },
}

/// Outcome of [`Ledger::verify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// Number of records checked.
    pub records: usize,
    /// Violations found.
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    /// Returns true if no violation was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Summary of what recovery found when the ledger was opened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryInfo {
    /// Committed transactions replayed.
    pub commits: usize,
    /// Records restored.
    pub records: usize,
    /// Bytes cut from a torn tail.
    pub truncated_bytes: u64,
    /// Why the tail was cut, if it was.
    pub reason: Option<String>,
}

/// Durable store of migration records.
///
/// Share one ledger between the runs of a process through `Arc<Ledger>`.
/// A file-backed ledger also holds an exclusive lock on its log file.
pub struct Ledger {
    backend: Mutex<Box<dyn LedgerBackend>>,
    state: RwLock<LedgerState>,
    locks: LockTable,
    next_txid: AtomicU64,
    next_record_id: AtomicU64,
    config: LedgerConfig,
    recovery: RecoveryInfo,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("records", &self.state.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Opens (or creates) the ledger log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Locked`] if another process has the ledger
    /// open, or an error if the log cannot be read.
    pub fn open(path: impl AsRef<Path>, config: LedgerConfig) -> LedgerResult<Self> {
        let backend = FileBackend::open(path.as_ref())?;
        Self::with_backend(Box::new(backend), config)
    }

    /// Creates an empty ledger kept in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::empty(Box::new(MemoryBackend::new()), LedgerConfig::default())
    }

    fn empty(backend: Box<dyn LedgerBackend>, config: LedgerConfig) -> Self {
        Self {
            backend: Mutex::new(backend),
            state: RwLock::new(LedgerState::default()),
            locks: LockTable::default(),
            next_txid: AtomicU64::new(1),
            next_record_id: AtomicU64::new(1),
            config,
            recovery: RecoveryInfo::default(),
        }
    }

    /// Opens a ledger over any backend, replaying its log.
    ///
    /// A torn tail (an interrupted append) is cut back to the last complete
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or truncated, or was
    /// written by an unsupported format version.
    pub fn with_backend(mut backend: Box<dyn LedgerBackend>, config: LedgerConfig) -> LedgerResult<Self> {
        let replay = log::replay(&*backend)?;
        let size = backend.size()?;

        let mut recovery = RecoveryInfo {
            commits: replay.commits,
            records: replay.records.len(),
            truncated_bytes: 0,
            reason: replay.torn.clone(),
        };
        if replay.valid_len < size {
            recovery.truncated_bytes = size - replay.valid_len;
            tracing::warn!(
                valid = replay.valid_len,
                size,
                reason = replay.torn.as_deref().unwrap_or("trailing bytes"),
                "truncating torn ledger tail"
            );
            backend.truncate(replay.valid_len)?;
        }

        let next_record_id = replay
            .records
            .keys()
            .next_back()
            .map_or(1, |id| id.as_u64() + 1);
        tracing::debug!(
            commits = replay.commits,
            records = replay.records.len(),
            "ledger replayed"
        );

        Ok(Self {
            backend: Mutex::new(backend),
            state: RwLock::new(LedgerState::from_records(replay.records)),
            locks: LockTable::default(),
            next_txid: AtomicU64::new(replay.max_txid + 1),
            next_record_id: AtomicU64::new(next_record_id),
            config,
            recovery,
        })
    }

    /// The configuration this ledger was opened with.
    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// What recovery found when the ledger was opened.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryInfo {
        &self.recovery
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read()
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write()
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub(crate) fn backend(&self) -> &Mutex<Box<dyn LedgerBackend>> {
        &self.backend
    }

    pub(crate) fn next_record_id(&self) -> &AtomicU64 {
        &self.next_record_id
    }

    /// Number of row and key locks currently held.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Starts a transaction.
    #[must_use]
    pub fn begin(&self) -> LedgerTxn<'_> {
        let txid = TxnId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        LedgerTxn::new(self, txid)
    }

    /// Runs `body` in a transaction and commits it.
    ///
    /// When `body` hits lock contention the transaction is abandoned (locks
    /// released, writes discarded) and `body` runs again after a backoff,
    /// up to the configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetryExhausted`] when every attempt hit
    /// contention, or the first non-contention error `body` or the commit
    /// returns.
    pub fn transaction<T, F>(&self, mut body: F) -> LedgerResult<T>
    where
        F: FnMut(&mut LedgerTxn<'_>) -> LedgerResult<T>,
    {
        let retry = &self.config.txn_retry;
        let attempts = retry.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            let mut txn = self.begin();
            match body(&mut txn) {
                Ok(value) => {
                    txn.commit()?;
                    return Ok(value);
                }
                Err(err) if err.is_contention() => {
                    tracing::debug!(attempt = attempt + 1, error = %err, "transaction contended, retrying");
                    last = err.to_string();
                    txn.abort();
                }
                Err(err) => return Err(err),
            }
        }

        Err(LedgerError::RetryExhausted { attempts, last })
    }

    /// Inserts one pending record in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn insert_pending(&self, new: NewRecord) -> LedgerResult<MigrationRecord> {
        let mut txn = self.begin();
        let record = txn.insert(new)?;
        txn.commit()?;
        Ok(record)
    }

    /// Reads a committed record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RecordNotFound`] if it does not exist.
    pub fn get(&self, id: RecordId) -> LedgerResult<MigrationRecord> {
        self.state
            .read()
            .get(id)
            .cloned()
            .ok_or(LedgerError::RecordNotFound(id))
    }

    /// Committed records matching `query`, ordered by ID.
    #[must_use]
    pub fn query(&self, query: &RecordQuery) -> Vec<MigrationRecord> {
        let state = self.state.read();
        let limit = query.max_results().unwrap_or(usize::MAX);
        state
            .candidate_ids(query)
            .into_iter()
            .filter_map(|id| state.get(id))
            .filter(|record| query.matches(record))
            .take(limit)
            .cloned()
            .collect()
    }

    /// A counter that grows whenever a record of `kind` commits as
    /// `success`.
    ///
    /// Callers caching lookups derived from successful records compare it
    /// against the value seen when the cache was built.
    #[must_use]
    pub fn success_generation(&self, kind: EntityKind) -> u64 {
        self.state.read().successes.get(&kind).copied().unwrap_or(0)
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Returns true if the ledger holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts records by kind and status.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let state = self.state.read();
        let mut stats = LedgerStats {
            records: state.len(),
            ..LedgerStats::default()
        };
        for record in state.records.values() {
            stats.totals.add(record.status);
            stats.by_kind.entry(record.kind).or_default().add(record.status);
        }
        stats
    }

    /// Checks the ledger invariants over all committed records.
    #[must_use]
    pub fn verify(&self) -> VerifyReport {
        let state = self.state.read();
        let mut report = VerifyReport {
            records: state.len(),
            violations: Vec::new(),
        };
        let mut canonical: BTreeMap<RecordKey, Vec<RecordId>> = BTreeMap::new();

        for record in state.records.values() {
            match record.status {
                RecordStatus::Success | RecordStatus::Failed => {
                    if let Some(key) = record.key() {
                        canonical.entry(key).or_default().push(record.id);
                    }
                    if record.status == RecordStatus::Success
                        && record.destination_entity_id.is_none()
                    {
                        report
                            .violations
                            .push(Violation::MissingDestination { record: record.id });
                    }
                }
                RecordStatus::Skipped => match record.canonical_id {
                    None => report
                        .violations
                        .push(Violation::MissingCanonical { record: record.id }),
                    Some(target) if state.get(target).is_none() => {
                        report.violations.push(Violation::DanglingCanonical {
                            record: record.id,
                            canonical: target,
                        });
                    }
                    Some(_) => {}
                },
                RecordStatus::Pending => {}
            }
        }

        for (key, records) in canonical {
            if records.len() > 1 {
                report
                    .violations
                    .push(Violation::DuplicateCanonical { key, records });
            }
        }
        report
    }
}
