//! Ledger transactions and the row/key lock table.

use crate::backend::LedgerBackend;
use crate::error::{LedgerError, LedgerResult};
use crate::log::{Frame, TxnId};
use crate::query::RecordQuery;
use crate::record::{MigrationRecord, NewRecord, RecordId, RecordKey};
use crate::store::Ledger;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering;

/// Something a transaction can lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum LockTarget {
    Record(RecordId),
    Key(RecordKey),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(id) => write!(f, "{id}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

/// Lock holders by target. Locks are never waited on: a lock held by
/// another transaction is reported immediately so the caller can back off.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    holders: Mutex<HashMap<LockTarget, TxnId>>,
}

enum Acquire {
    Acquired,
    AlreadyHeld,
    HeldByOther(TxnId),
}

impl LockTable {
    fn try_acquire(&self, target: &LockTarget, txid: TxnId) -> Acquire {
        let mut holders = self.holders.lock();
        match holders.get(target) {
            Some(holder) if *holder == txid => Acquire::AlreadyHeld,
            Some(holder) => Acquire::HeldByOther(*holder),
            None => {
                holders.insert(target.clone(), txid);
                Acquire::Acquired
            }
        }
    }

    fn release(&self, target: &LockTarget, txid: TxnId) {
        let mut holders = self.holders.lock();
        if holders.get(target) == Some(&txid) {
            holders.remove(target);
        }
    }

    fn release_all(&self, targets: &HashSet<LockTarget>, txid: TxnId) {
        let mut holders = self.holders.lock();
        for target in targets {
            if holders.get(target) == Some(&txid) {
                holders.remove(target);
            }
        }
    }

    /// Number of locks currently held, across all transactions.
    pub(crate) fn len(&self) -> usize {
        self.holders.lock().len()
    }
}

/// A short-lived read-write transaction on the ledger.
///
/// Reads see committed state plus the transaction's own buffered writes.
/// Writes stay buffered until [`commit`](Self::commit), which appends them to
/// the log as one atomic unit. Locks are released on commit, abort or drop.
pub struct LedgerTxn<'a> {
    ledger: &'a Ledger,
    txid: TxnId,
    writes: BTreeMap<RecordId, MigrationRecord>,
    inserted: HashSet<RecordId>,
    held: HashSet<LockTarget>,
    active: bool,
}

impl<'a> LedgerTxn<'a> {
    pub(crate) fn new(ledger: &'a Ledger, txid: TxnId) -> Self {
        Self {
            ledger,
            txid,
            writes: BTreeMap::new(),
            inserted: HashSet::new(),
            held: HashSet::new(),
            active: true,
        }
    }

    /// This transaction's ID.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.txid
    }

    /// Returns true until the transaction commits or aborts.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn ensure_active(&self) -> LedgerResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(LedgerError::TransactionClosed)
        }
    }

    /// Reads a record as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RecordNotFound`] if no such record exists.
    pub fn get(&self, id: RecordId) -> LedgerResult<MigrationRecord> {
        if let Some(record) = self.writes.get(&id) {
            return Ok(record.clone());
        }
        self.ledger.get(id)
    }

    /// Returns the records matching `query`, ordered by ID.
    #[must_use]
    pub fn find(&self, query: &RecordQuery) -> Vec<MigrationRecord> {
        let state = self.ledger.state();
        let mut ids: BTreeSet<RecordId> = state.candidate_ids(query);
        ids.extend(self.writes.keys().copied());

        let limit = query.max_results().unwrap_or(usize::MAX);
        ids.into_iter()
            .filter_map(|id| self.writes.get(&id).or_else(|| state.get(id)))
            .filter(|record| query.matches(record))
            .take(limit)
            .cloned()
            .collect()
    }

    fn acquire(&mut self, target: LockTarget) -> LedgerResult<()> {
        match self.ledger.locks().try_acquire(&target, self.txid) {
            Acquire::Acquired => {
                self.held.insert(target);
                Ok(())
            }
            Acquire::AlreadyHeld => Ok(()),
            Acquire::HeldByOther(holder) => {
                tracing::trace!(txn = %self.txid, %holder, lock = %target, "lock contention");
                Err(LedgerError::contention(target.to_string()))
            }
        }
    }

    /// Locks a record for update and returns its current image.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LockContention`] if another transaction holds
    /// the record, or [`LedgerError::RecordNotFound`].
    pub fn lock(&mut self, id: RecordId) -> LedgerResult<MigrationRecord> {
        self.ensure_active()?;
        self.acquire(LockTarget::Record(id))?;
        self.get(id)
    }

    /// Locks the first record matching `query`, in ID order.
    ///
    /// Records locked by other transactions are passed over, and every
    /// candidate is re-checked against the query once locked, so the returned
    /// record still matches.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TransactionClosed`] if the transaction is over.
    pub fn lock_first(&mut self, query: &RecordQuery) -> LedgerResult<Option<MigrationRecord>> {
        self.ensure_active()?;
        let candidates: Vec<RecordId> = self
            .find(&query.clone().limit(usize::MAX))
            .into_iter()
            .map(|record| record.id)
            .collect();

        for id in candidates {
            let target = LockTarget::Record(id);
            let newly = match self.ledger.locks().try_acquire(&target, self.txid) {
                Acquire::Acquired => true,
                Acquire::AlreadyHeld => false,
                Acquire::HeldByOther(_) => continue,
            };

            let current = self.get(id)?;
            if query.matches(&current) {
                if newly {
                    self.held.insert(target);
                }
                return Ok(Some(current));
            }
            if newly {
                self.ledger.locks().release(&target, self.txid);
            }
        }
        Ok(None)
    }

    /// Locks a record key. Resolve and the terminal update hold this lock so
    /// two transactions never settle the same key at once.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LockContention`] if another transaction holds
    /// the key.
    pub fn lock_key(&mut self, key: &RecordKey) -> LedgerResult<()> {
        self.ensure_active()?;
        self.acquire(LockTarget::Key(key.clone()))
    }

    /// Inserts a new pending record. The record is locked by this
    /// transaction and becomes visible to others on commit.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TransactionClosed`] if the transaction is over.
    pub fn insert(&mut self, new: NewRecord) -> LedgerResult<MigrationRecord> {
        self.ensure_active()?;
        let id = RecordId::new(self.ledger.next_record_id().fetch_add(1, Ordering::SeqCst));
        let record = MigrationRecord::from_new(id, new, Utc::now());

        self.acquire(LockTarget::Record(id))?;
        self.inserted.insert(id);
        self.writes.insert(id, record.clone());
        Ok(record)
    }

    /// Buffers a new image of a record this transaction has locked.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotLocked`] without the row lock, and
    /// [`LedgerError::InvalidTransition`] if the committed record is already
    /// terminal.
    pub fn update(&mut self, record: MigrationRecord) -> LedgerResult<()> {
        self.ensure_active()?;
        let id = record.id;
        if !self.held.contains(&LockTarget::Record(id)) {
            return Err(LedgerError::NotLocked(id));
        }
        if !self.inserted.contains(&id) {
            let committed = self.ledger.get(id)?;
            if committed.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    record: id,
                    from: committed.status,
                    to: record.status,
                });
            }
        }
        self.writes.insert(id, record);
        Ok(())
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Appends the buffered writes to the log and publishes them.
    ///
    /// # Errors
    ///
    /// Returns an error if the log append fails; nothing is published then.
    pub fn commit(mut self) -> LedgerResult<()> {
        self.ensure_active()?;
        self.active = false;

        let writes = std::mem::take(&mut self.writes);
        if !writes.is_empty() {
            let result = self.ledger.publish(self.txid, writes);
            self.release();
            result?;
        } else {
            self.release();
        }
        Ok(())
    }

    /// Discards buffered writes and releases all locks.
    pub fn abort(mut self) {
        self.active = false;
        self.writes.clear();
        self.release();
    }

    fn release(&mut self) {
        self.ledger.locks().release_all(&self.held, self.txid);
        self.held.clear();
    }
}

impl Drop for LedgerTxn<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.release();
        }
    }
}

impl Ledger {
    /// Writes one transaction to the log and applies it to the committed
    /// state. On an append failure the log is cut back to where it was.
    fn publish(&self, txid: TxnId, writes: BTreeMap<RecordId, MigrationRecord>) -> LedgerResult<()> {
        let mut bytes = Frame::Begin { txid }.encode()?;
        for record in writes.values() {
            bytes.extend(
                Frame::Put {
                    txid,
                    record: record.clone(),
                }
                .encode()?,
            );
        }
        bytes.extend(Frame::Commit { txid }.encode()?);

        let mut backend = self.backend().lock();
        let start = backend.size()?;
        if let Err(err) = append_durably(&mut **backend, &bytes, self.config().sync_on_commit) {
            if let Err(cut) = backend.truncate(start) {
                tracing::error!(txn = %txid, error = %cut, "failed to cut back partial commit");
            }
            return Err(err);
        }

        let mut state = self.state_mut();
        for record in writes.into_values() {
            state.put(record);
        }
        tracing::trace!(txn = %txid, bytes = bytes.len(), "committed");
        Ok(())
    }
}

fn append_durably(backend: &mut dyn LedgerBackend, bytes: &[u8], sync: bool) -> LedgerResult<()> {
    backend.append(bytes)?;
    backend.flush()?;
    if sync {
        backend.sync()?;
    }
    Ok(())
}
