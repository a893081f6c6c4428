//! Concurrent-run helpers.
//!
//! These run several engines over one shared ledger and the same systems,
//! the way independent workers of one process would.

use crate::fixtures::{legacy, shop, Harness};
use carryover_engine::{EngineConfig, EngineResult, MigrationSummary};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a concurrent run.
#[derive(Debug)]
pub struct ConcurrentRuns {
    /// Each run's result, in thread order.
    pub results: Vec<EngineResult<MigrationSummary>>,
    /// Wall time for all runs.
    pub duration: Duration,
}

impl ConcurrentRuns {
    /// Summaries of the runs that finished.
    pub fn summaries(&self) -> Vec<&MigrationSummary> {
        self.results.iter().filter_map(|r| r.as_ref().ok()).collect()
    }

    /// Imported records across all runs.
    pub fn imported(&self) -> usize {
        self.summaries().iter().map(|s| s.imported).sum()
    }

    /// Failed records across all runs.
    pub fn failed(&self) -> usize {
        self.summaries().iter().map(|s| s.failed).sum()
    }

    /// Runs that returned an error.
    pub fn errors(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }
}

/// Runs `runs` full migrations at once, each with its own engine built
/// from `config`.
pub fn migrate_concurrently(harness: &Harness, runs: usize, config: &EngineConfig) -> ConcurrentRuns {
    let start = Instant::now();
    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..runs)
            .map(|_| {
                let engine = harness.engine_with(config.clone());
                scope.spawn(move || engine.run_migration(&legacy(), &shop(), None))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("migration thread panicked"))
            .collect()
    });
    ConcurrentRuns {
        results,
        duration: start.elapsed(),
    }
}

/// Stages the source `times` times at once.
pub fn stage_concurrently(harness: &Harness, times: usize) -> usize {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..times)
            .map(|_| scope.spawn(|| harness.engine.stage_export(&legacy())))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .expect("staging thread panicked")
                    .expect("staging failed")
                    .rows_staged()
            })
            .sum()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{coupon, shared_ledger, source_with, test_config};
    use carryover_engine::MemorySystem;
    use carryover_ledger::EntityKind;
    use std::sync::Arc;

    #[test]
    fn concurrent_staging_keeps_every_row() {
        let h = Harness::new(source_with(
            EntityKind::Coupon,
            [coupon("c-1", "A"), coupon("c-2", "B")],
        ));
        assert_eq!(stage_concurrently(&h, 4), 8);
        assert_eq!(h.ledger.len(), 8);
    }

    #[test]
    fn concurrent_runs_report_each_run() {
        let h = Harness::with_parts(
            shared_ledger(),
            Arc::new(source_with(EntityKind::Coupon, [coupon("c-1", "A")])),
            Arc::new(MemorySystem::new("shop")),
            test_config(),
        );
        let runs = migrate_concurrently(&h, 3, &test_config());
        assert_eq!(runs.results.len(), 3);
        assert_eq!(runs.errors(), 0);
        assert_eq!(runs.imported(), 1);
    }
}
