//! Claim/Resolve: acquiring a pending record and settling it against the
//! canonical record for its key.
//!
//! Every processed entity goes through [`ClaimCoordinator::claim_or_create`],
//! then [`ClaimCoordinator::resolve`], then at most one
//! [`ClaimCoordinator::complete`]. However many pending rows exist for a
//! source entity, and however many runs race over it, this converges on one
//! canonical terminal record per key.

use carryover_ledger::{
    ClaimMarker, DestinationFilter, EntityFilter, EntityKind, Ledger, LedgerError, LedgerResult,
    LedgerTxn, MigrationRecord, NewRecord, Outcome, OwnerId, RecordKey, RecordQuery, RecordStatus,
    RunId, SystemId,
};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Where a claimed record stands after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The caller owns this pending record and must complete it.
    Active(MigrationRecord),
    /// The key already has a terminal canonical record.
    Settled(MigrationRecord),
    /// Another run holds the canonical pending record.
    Busy(MigrationRecord),
}

impl Resolution {
    /// The canonical record.
    #[must_use]
    pub fn record(&self) -> &MigrationRecord {
        match self {
            Self::Active(record) | Self::Settled(record) | Self::Busy(record) => record,
        }
    }
}

/// Claims and settles records for one run between one source and one
/// destination.
#[derive(Debug)]
pub struct ClaimCoordinator<'a> {
    ledger: &'a Ledger,
    owner: OwnerId,
    source: SystemId,
    destination: SystemId,
    run: RunId,
    lease: Duration,
}

impl<'a> ClaimCoordinator<'a> {
    /// Creates a coordinator for `run`.
    pub fn new(
        ledger: &'a Ledger,
        owner: OwnerId,
        source: SystemId,
        destination: SystemId,
        run: RunId,
        lease: Duration,
    ) -> Self {
        Self {
            ledger,
            owner,
            source,
            destination,
            run,
            lease,
        }
    }

    /// The run this coordinator claims for.
    #[must_use]
    pub fn run(&self) -> RunId {
        self.run
    }

    /// Claims the best pending record for a source entity.
    ///
    /// Tiers, first match wins: a pending record for this exact entity, a
    /// placeholder, then any pending record of the kind, oldest first. Only
    /// records without a destination or bound to this run's destination are
    /// considered, and never one holding a live claim.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetryExhausted`] if the claim transaction kept
    /// hitting lock contention.
    pub fn claim(
        &self,
        kind: EntityKind,
        source_entity_id: &str,
        source_entity_name: Option<&str>,
    ) -> LedgerResult<Option<MigrationRecord>> {
        self.ledger.transaction(|txn| {
            self.claim_in(txn, kind, source_entity_id, source_entity_name, Utc::now())
        })
    }

    /// Like [`claim`](Self::claim), but inserts a claimed record when no
    /// pending record is available.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetryExhausted`] if the claim transaction kept
    /// hitting lock contention.
    pub fn claim_or_create(
        &self,
        kind: EntityKind,
        source_entity_id: &str,
        source_entity_name: Option<&str>,
    ) -> LedgerResult<MigrationRecord> {
        self.ledger.transaction(|txn| {
            let now = Utc::now();
            if let Some(record) = self.claim_in(txn, kind, source_entity_id, source_entity_name, now)? {
                return Ok(record);
            }
            let record = txn.insert(
                NewRecord::staged(
                    self.owner.clone(),
                    kind,
                    self.source.clone(),
                    source_entity_id,
                    source_entity_name.map(str::to_string),
                )
                .with_destination(self.destination.clone())
                .with_claim(ClaimMarker::new(self.run, now)),
            )?;
            debug!(record = %record.id, kind = %kind, entity = source_entity_id, "created record just in time");
            Ok(record)
        })
    }

    fn claim_in(
        &self,
        txn: &mut LedgerTxn<'_>,
        kind: EntityKind,
        source_entity_id: &str,
        source_entity_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<MigrationRecord>> {
        let base = RecordQuery::new()
            .owner(self.owner.clone())
            .kind(kind)
            .source_system(self.source.clone())
            .destination(DestinationFilter::UnsetOr(self.destination.clone()))
            .status(RecordStatus::Pending)
            .claimable(now, self.lease);
        let tiers = [
            base.clone()
                .source_entity(EntityFilter::Is(source_entity_id.to_string())),
            base.clone().source_entity(EntityFilter::Unset),
            base,
        ];

        for query in &tiers {
            if let Some(mut record) = txn.lock_first(query)? {
                record.claim = Some(ClaimMarker::new(self.run, now));
                record.destination_system = Some(self.destination.clone());
                if record.source_entity_id.as_deref() != Some(source_entity_id) {
                    record.source_entity_id = Some(source_entity_id.to_string());
                    record.source_entity_name = source_entity_name.map(str::to_string);
                }
                record.updated_at = now;
                txn.update(record.clone())?;
                debug!(record = %record.id, kind = %kind, entity = source_entity_id, "claimed");
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Settles a claimed record against the canonical record for its key.
    ///
    /// Skipped records are never canonical. A terminal record for the key
    /// wins ([`Resolution::Settled`]). A pending record live-claimed by
    /// another run means that run is already working on the key
    /// ([`Resolution::Busy`]). Otherwise the oldest pending record is
    /// canonical and the caller takes over its claim ([`Resolution::Active`]).
    /// When the canonical record is not `claimed`, `claimed` is skipped with
    /// a back-reference.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetryExhausted`] on persistent contention.
    pub fn resolve(&self, claimed: &MigrationRecord) -> LedgerResult<Resolution> {
        let key = record_key(claimed)?;
        self.ledger.transaction(|txn| {
            let now = Utc::now();
            txn.lock_key(&key)?;
            let mine = txn.lock(claimed.id)?;
            if mine.is_terminal() {
                return Ok(Resolution::Settled(mine));
            }

            let candidates = txn.find(
                &RecordQuery::for_key(&key).exclude_status(RecordStatus::Skipped),
            );

            if let Some(terminal) = candidates.iter().find(|r| r.is_terminal()) {
                supersede(txn, mine, terminal, now)?;
                return Ok(Resolution::Settled(terminal.clone()));
            }

            let held_elsewhere = candidates.iter().find(|r| {
                r.id != mine.id
                    && r.claim
                        .is_some_and(|claim| claim.run != self.run && claim.is_live(now, self.lease))
            });
            if let Some(holder) = held_elsewhere {
                supersede(txn, mine, holder, now)?;
                return Ok(Resolution::Busy(holder.clone()));
            }

            let Some(oldest) = candidates.into_iter().next() else {
                return Ok(Resolution::Active(mine));
            };
            if oldest.id == mine.id {
                return Ok(Resolution::Active(mine));
            }

            let mut canonical = txn.lock(oldest.id)?;
            canonical.claim = Some(ClaimMarker::new(self.run, now));
            canonical.updated_at = now;
            txn.update(canonical.clone())?;
            supersede(txn, mine, &canonical, now)?;
            Ok(Resolution::Active(canonical))
        })
    }

    /// Applies the single terminal update to an active record.
    ///
    /// If another record for the same key became terminal in the meantime,
    /// the record is skipped in its favour instead. A record that is already
    /// terminal is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RetryExhausted`] on persistent contention.
    pub fn complete(&self, record: &MigrationRecord, outcome: Outcome) -> LedgerResult<MigrationRecord> {
        let key = record_key(record)?;
        self.ledger.transaction(|txn| {
            txn.lock_key(&key)?;
            let mut current = txn.lock(record.id)?;
            if current.is_terminal() {
                return Ok(current);
            }

            let winner = txn
                .find(&RecordQuery::for_key(&key).exclude_status(RecordStatus::Skipped))
                .into_iter()
                .find(|r| r.id != current.id && r.is_terminal());
            let applied = match winner {
                Some(winner) => Outcome::superseded_by(winner.id),
                None => outcome.clone(),
            };

            current.apply(applied, Utc::now())?;
            txn.update(current.clone())?;
            debug!(record = %current.id, status = %current.status, "completed");
            Ok(current)
        })
    }
}

fn record_key(record: &MigrationRecord) -> LedgerResult<RecordKey> {
    record.key().ok_or_else(|| {
        LedgerError::corrupted(format!(
            "{} has no destination or source entity and cannot be resolved",
            record.id
        ))
    })
}

fn supersede(
    txn: &mut LedgerTxn<'_>,
    mut record: MigrationRecord,
    canonical: &MigrationRecord,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    record.apply(Outcome::superseded_by(canonical.id), now)?;
    debug!(record = %record.id, canonical = %canonical.id, "superseded");
    txn.update(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const LEASE_MINUTES: i64 = 15;

    fn coordinator(ledger: &Ledger, run: RunId) -> ClaimCoordinator<'_> {
        ClaimCoordinator::new(
            ledger,
            OwnerId::new("acme"),
            SystemId::new("legacy"),
            SystemId::new("shop"),
            run,
            Duration::minutes(LEASE_MINUTES),
        )
    }

    fn stage(ledger: &Ledger, id: &str) -> MigrationRecord {
        ledger
            .insert_pending(NewRecord::staged(
                OwnerId::new("acme"),
                EntityKind::Coupon,
                SystemId::new("legacy"),
                id,
                Some(id.to_uppercase()),
            ))
            .unwrap()
    }

    fn placeholder(ledger: &Ledger) -> MigrationRecord {
        ledger
            .insert_pending(NewRecord::placeholder(
                OwnerId::new("acme"),
                EntityKind::Coupon,
                SystemId::new("legacy"),
            ))
            .unwrap()
    }

    #[test]
    fn claim_prefers_exact_then_placeholder_then_any() {
        let ledger = Ledger::in_memory();
        let other = stage(&ledger, "c-9");
        let hole = placeholder(&ledger);
        let exact = stage(&ledger, "c-1");
        let coord = coordinator(&ledger, RunId::new());

        let first = coord.claim(EntityKind::Coupon, "c-1", Some("SAVE10")).unwrap().unwrap();
        assert_eq!(first.id, exact.id);
        assert_eq!(first.destination_system, Some(SystemId::new("shop")));
        assert_eq!(first.claim.unwrap().run, coord.run());

        let second = coord.claim(EntityKind::Coupon, "c-2", Some("TWO")).unwrap().unwrap();
        assert_eq!(second.id, hole.id);
        assert_eq!(second.source_entity_id.as_deref(), Some("c-2"));
        assert_eq!(second.source_entity_name.as_deref(), Some("TWO"));

        let third = coord.claim(EntityKind::Coupon, "c-3", None).unwrap().unwrap();
        assert_eq!(third.id, other.id);
        assert_eq!(third.source_entity_id.as_deref(), Some("c-3"));
    }

    #[test]
    fn claim_skips_rows_claimed_by_live_runs() {
        let ledger = Ledger::in_memory();
        stage(&ledger, "c-1");
        let first = coordinator(&ledger, RunId::new());
        let second = coordinator(&ledger, RunId::new());

        assert!(first.claim(EntityKind::Coupon, "c-1", None).unwrap().is_some());
        assert!(second.claim(EntityKind::Coupon, "c-1", None).unwrap().is_none());

        let created = second.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();
        assert_eq!(created.status, RecordStatus::Pending);
        assert_eq!(created.claim.unwrap().run, second.run());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn expired_claims_can_be_taken_over() {
        let ledger = Ledger::in_memory();
        let staged = stage(&ledger, "c-1");
        let crashed = coordinator(&ledger, RunId::new());
        crashed.claim(EntityKind::Coupon, "c-1", None).unwrap();

        let successor = ClaimCoordinator::new(
            &ledger,
            OwnerId::new("acme"),
            SystemId::new("legacy"),
            SystemId::new("shop"),
            RunId::new(),
            Duration::zero(),
        );
        let claimed = successor.claim(EntityKind::Coupon, "c-1", None).unwrap().unwrap();
        assert_eq!(claimed.id, staged.id);
    }

    #[test]
    fn claim_ignores_other_destinations() {
        let ledger = Ledger::in_memory();
        let staged = stage(&ledger, "c-1");
        let elsewhere = ClaimCoordinator::new(
            &ledger,
            OwnerId::new("acme"),
            SystemId::new("legacy"),
            SystemId::new("warehouse"),
            RunId::new(),
            Duration::minutes(LEASE_MINUTES),
        );
        elsewhere.claim(EntityKind::Coupon, "c-1", None).unwrap();
        elsewhere
            .complete(&ledger.get(staged.id).unwrap(), Outcome::success("w-1"))
            .unwrap();

        let coord = coordinator(&ledger, RunId::new());
        let created = coord.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();
        assert_ne!(created.id, staged.id);
        assert!(matches!(coord.resolve(&created).unwrap(), Resolution::Active(_)));
    }

    #[test]
    fn resolve_settles_against_terminal_record() {
        let ledger = Ledger::in_memory();
        stage(&ledger, "c-1");
        let coord = coordinator(&ledger, RunId::new());

        let first = coord.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();
        let Resolution::Active(active) = coord.resolve(&first).unwrap() else {
            panic!("expected active");
        };
        let done = coord.complete(&active, Outcome::success("d-1")).unwrap();
        assert_eq!(done.status, RecordStatus::Success);

        stage(&ledger, "c-1");
        let rerun = coordinator(&ledger, RunId::new());
        let second = rerun.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();
        assert_ne!(second.id, first.id);

        let resolution = rerun.resolve(&second).unwrap();
        assert!(matches!(&resolution, Resolution::Settled(r) if r.id == first.id));

        let skipped = ledger.get(second.id).unwrap();
        assert_eq!(skipped.status, RecordStatus::Skipped);
        assert_eq!(skipped.canonical_id, Some(first.id));
        assert_eq!(
            skipped.error_message.as_deref(),
            Some(format!("superseded by canonical record {}", first.id).as_str())
        );
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn resolve_reports_busy_when_another_run_holds_the_key() {
        let ledger = Ledger::in_memory();
        stage(&ledger, "c-1");
        let holder = coordinator(&ledger, RunId::new());
        let held = holder.claim(EntityKind::Coupon, "c-1", None).unwrap().unwrap();

        let other = coordinator(&ledger, RunId::new());
        let mine = other.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();
        let resolution = other.resolve(&mine).unwrap();
        assert!(matches!(&resolution, Resolution::Busy(r) if r.id == held.id));
        assert_eq!(ledger.get(mine.id).unwrap().status, RecordStatus::Skipped);
    }

    #[test]
    fn repurposed_older_rows_do_not_steal_an_active_key() {
        let ledger = Ledger::in_memory();
        let older = stage(&ledger, "c-2");
        let target = stage(&ledger, "c-1");

        let a = coordinator(&ledger, RunId::new());
        let a_record = a.claim(EntityKind::Coupon, "c-1", None).unwrap().unwrap();
        assert_eq!(a_record.id, target.id);
        assert!(matches!(a.resolve(&a_record).unwrap(), Resolution::Active(_)));

        let b = coordinator(&ledger, RunId::new());
        let b_record = b.claim(EntityKind::Coupon, "c-1", None).unwrap().unwrap();
        assert_eq!(b_record.id, older.id);
        let resolution = b.resolve(&b_record).unwrap();
        assert!(matches!(&resolution, Resolution::Busy(r) if r.id == target.id));
        assert_eq!(ledger.get(older.id).unwrap().status, RecordStatus::Skipped);
    }

    #[test]
    fn resolve_takes_over_an_abandoned_older_record() {
        let ledger = Ledger::in_memory();
        let older = stage(&ledger, "c-1");
        let crashed = coordinator(&ledger, RunId::new());
        crashed.claim(EntityKind::Coupon, "c-1", None).unwrap();

        let successor = ClaimCoordinator::new(
            &ledger,
            OwnerId::new("acme"),
            SystemId::new("legacy"),
            SystemId::new("shop"),
            RunId::new(),
            Duration::zero(),
        );
        // A fresh row for the same entity, claimed before the older one.
        let mut txn = ledger.begin();
        let fresh = txn
            .insert(
                NewRecord::staged(
                    OwnerId::new("acme"),
                    EntityKind::Coupon,
                    SystemId::new("legacy"),
                    "c-1",
                    None,
                )
                .with_destination(SystemId::new("shop"))
                .with_claim(ClaimMarker::new(successor.run(), Utc::now())),
            )
            .unwrap();
        txn.commit().unwrap();

        let resolution = successor.resolve(&fresh).unwrap();
        let Resolution::Active(canonical) = resolution else {
            panic!("expected active");
        };
        assert_eq!(canonical.id, older.id);
        assert_eq!(canonical.claim.unwrap().run, successor.run());
        assert_eq!(ledger.get(fresh.id).unwrap().status, RecordStatus::Skipped);
    }

    #[test]
    fn complete_loses_to_a_concurrent_winner() {
        let ledger = Ledger::in_memory();
        stage(&ledger, "c-1");
        let a = coordinator(&ledger, RunId::new());
        let a_record = a.claim_or_create(EntityKind::Coupon, "c-1", None).unwrap();

        // A second record for the key reaches success without going through
        // resolve, as a racing process would have.
        let b = ClaimCoordinator::new(
            &ledger,
            OwnerId::new("acme"),
            SystemId::new("legacy"),
            SystemId::new("shop"),
            RunId::new(),
            Duration::zero(),
        );
        let mut txn = ledger.begin();
        let b_record = txn
            .insert(
                NewRecord::staged(
                    OwnerId::new("acme"),
                    EntityKind::Coupon,
                    SystemId::new("legacy"),
                    "c-1",
                    None,
                )
                .with_destination(SystemId::new("shop")),
            )
            .unwrap();
        txn.commit().unwrap();
        b.complete(&b_record, Outcome::success("d-b")).unwrap();

        let result = a.complete(&a_record, Outcome::success("d-a")).unwrap();
        assert_eq!(result.status, RecordStatus::Skipped);
        assert_eq!(result.canonical_id, Some(b_record.id));
        assert!(ledger.verify().is_ok());

        // Completing again is a no-op.
        let again = a.complete(&a_record, Outcome::failed("late")).unwrap();
        assert_eq!(again.status, RecordStatus::Skipped);
    }

    #[test]
    fn concurrent_claims_never_share_a_record() {
        let ledger = Arc::new(Ledger::in_memory());
        for _ in 0..4 {
            stage(&ledger, "c-1");
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let coord = coordinator(&ledger, RunId::new());
                    coord.claim(EntityKind::Coupon, "c-1", None)
                })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(Some(record)) => claimed.push(record.id),
                Ok(None) | Err(LedgerError::RetryExhausted { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let unique: std::collections::HashSet<_> = claimed.iter().collect();
        assert_eq!(unique.len(), claimed.len());
        assert!(claimed.len() <= 4);
        assert_eq!(ledger.held_locks(), 0);
    }
}
