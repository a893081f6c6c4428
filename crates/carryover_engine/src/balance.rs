//! Scalar balance reconciliation with optimistic concurrency.
//!
//! The reconciler converges a destination balance on a desired value:
//!
//! 1. Read the balance and its revision. Equal already: nothing to do.
//! 2. Absolute set carrying the observed revision.
//! 3. On a revision conflict, re-read and retry the absolute set once.
//! 4. Still rejected: adjust by a delta computed from a fresh read.
//! 5. Verify with a few reads spaced by the settle delay; on mismatch, one
//!    final absolute set with a fresh revision.
//!
//! Drift left after all of that is a warning, never an error.

use crate::collaborator::BalanceService;
use crate::error::{EngineError, EngineResult};
use carryover_ledger::EntityKind;
use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How a reconciliation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BalanceOutcome {
    /// The balance already matched.
    Unchanged,
    /// The balance matches after `writes` writes.
    Converged {
        /// Corrective writes issued.
        writes: u32,
    },
    /// The balance still differs after every retry.
    Drifted {
        /// Desired balance.
        expected: i64,
        /// Last balance read.
        observed: i64,
        /// Corrective writes issued.
        writes: u32,
    },
}

impl BalanceOutcome {
    /// Corrective writes issued.
    #[must_use]
    pub fn writes(&self) -> u32 {
        match self {
            Self::Unchanged => 0,
            Self::Converged { writes } | Self::Drifted { writes, .. } => *writes,
        }
    }
}

/// Converges balances held by one [`BalanceService`].
pub struct BalanceReconciler<'a> {
    service: &'a dyn BalanceService,
    verify_reads: u32,
    settle_delay: Duration,
}

impl<'a> BalanceReconciler<'a> {
    /// Creates a reconciler. `verify_reads` is at least one.
    pub fn new(service: &'a dyn BalanceService, verify_reads: u32, settle_delay: Duration) -> Self {
        Self {
            service,
            verify_reads: verify_reads.max(1),
            settle_delay,
        }
    }

    /// Moves the balance of `entity_id` to `desired`.
    ///
    /// # Errors
    ///
    /// Returns the service's error if a read or a non-conflict write fails,
    /// or [`EngineError::BalanceOverflow`] if the delta does not fit.
    pub fn reconcile(&self, kind: EntityKind, entity_id: &str, desired: i64) -> EngineResult<BalanceOutcome> {
        let current = self.service.read_balance(kind, entity_id)?;
        if current.points == desired {
            return Ok(BalanceOutcome::Unchanged);
        }

        let mut writes = 0;
        self.converge(kind, entity_id, desired, current.revision, &mut writes)?;
        let observed = self.verify(kind, entity_id, desired)?;
        if observed == desired {
            return Ok(BalanceOutcome::Converged { writes });
        }

        let fresh = self.service.read_balance(kind, entity_id)?;
        if fresh.points != desired {
            match self.service.set_balance(kind, entity_id, desired, fresh.revision) {
                Ok(_) => writes += 1,
                Err(EngineError::ConcurrencyConflict { .. }) => {
                    debug!(kind = %kind, entity = entity_id, "final balance set lost a revision race");
                }
                Err(err) => return Err(err),
            }
        }

        let observed = self.verify(kind, entity_id, desired)?;
        if observed == desired {
            return Ok(BalanceOutcome::Converged { writes });
        }
        warn!(
            kind = %kind,
            entity = entity_id,
            expected = desired,
            observed,
            "balance drift after reconciliation"
        );
        Ok(BalanceOutcome::Drifted {
            expected: desired,
            observed,
            writes,
        })
    }

    fn converge(
        &self,
        kind: EntityKind,
        entity_id: &str,
        desired: i64,
        revision: u64,
        writes: &mut u32,
    ) -> EngineResult<()> {
        if self.try_set(kind, entity_id, desired, revision, writes)? {
            return Ok(());
        }

        let latest = self.service.read_balance(kind, entity_id)?;
        if latest.points == desired {
            return Ok(());
        }
        if self.try_set(kind, entity_id, desired, latest.revision, writes)? {
            return Ok(());
        }

        let fresh = self.service.read_balance(kind, entity_id)?;
        let delta = desired
            .checked_sub(fresh.points)
            .ok_or_else(|| EngineError::BalanceOverflow {
                resource: format!("{kind}/{entity_id}"),
                message: format!("{desired} - {}", fresh.points),
            })?;
        if delta != 0 {
            debug!(kind = %kind, entity = entity_id, delta, "absolute set rejected twice, adjusting by delta");
            self.service.adjust_balance(kind, entity_id, delta)?;
            *writes += 1;
        }
        Ok(())
    }

    /// `Ok(false)` on a revision conflict.
    fn try_set(
        &self,
        kind: EntityKind,
        entity_id: &str,
        desired: i64,
        revision: u64,
        writes: &mut u32,
    ) -> EngineResult<bool> {
        match self.service.set_balance(kind, entity_id, desired, revision) {
            Ok(_) => {
                *writes += 1;
                Ok(true)
            }
            Err(EngineError::ConcurrencyConflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reads until the balance matches or the reads run out. Returns the
    /// last balance seen.
    fn verify(&self, kind: EntityKind, entity_id: &str, desired: i64) -> EngineResult<i64> {
        let mut observed = self.service.read_balance(kind, entity_id)?.points;
        for _ in 1..self.verify_reads {
            if observed == desired {
                break;
            }
            thread::sleep(self.settle_delay);
            observed = self.service.read_balance(kind, entity_id)?.points;
        }
        Ok(observed)
    }
}
