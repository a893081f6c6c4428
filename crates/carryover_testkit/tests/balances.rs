//! Balance reconciliation converges within its retry budget.

use carryover_engine::{BalanceOutcome, BalanceReconciler, BalanceService};
use carryover_testkit::prelude::*;
use proptest::prelude::*;
use std::time::Duration;

fn account_system(points: i64) -> MemorySystem {
    MemorySystem::new("shop").with_entities(
        EntityKind::LoyaltyAccount,
        [loyalty_account("u-1", "ann@example.com", points)],
    )
}

fn reconcile(system: &MemorySystem, desired: i64) -> BalanceOutcome {
    BalanceReconciler::new(system, 3, Duration::ZERO)
        .reconcile(EntityKind::LoyaltyAccount, "u-1", desired)
        .unwrap()
}

fn read(system: &MemorySystem) -> i64 {
    system
        .read_balance(EntityKind::LoyaltyAccount, "u-1")
        .unwrap()
        .points
}

proptest! {
    #[test]
    fn converges_from_any_start(case in balance_case_strategy()) {
        let (current, desired) = case;
        let system = account_system(current);
        let outcome = reconcile(&system, desired);
        prop_assert_eq!(read(&system), desired);
        if current == desired {
            prop_assert_eq!(outcome, BalanceOutcome::Unchanged);
        } else {
            prop_assert_eq!(outcome, BalanceOutcome::Converged { writes: 1 });
        }
    }

    #[test]
    fn converges_through_conflicts(case in balance_case_strategy(), conflicts in 0usize..3) {
        let (current, desired) = case;
        prop_assume!(current != desired);
        let system = account_system(current);
        system.conflict_next_sets(conflicts);

        let outcome = reconcile(&system, desired);
        prop_assert!(matches!(outcome, BalanceOutcome::Converged { .. }), "expected Converged, got {:?}", outcome);
        prop_assert_eq!(read(&system), desired);
    }
}

#[test]
fn delta_write_when_every_set_conflicts() {
    let system = account_system(40);
    system.reject_all_sets(true);

    let outcome = reconcile(&system, 140);
    assert!(matches!(outcome, BalanceOutcome::Converged { .. }));
    assert_eq!(read(&system), 140);
    assert_eq!(system.calls().balance_adjusts, 1);
}

#[test]
fn reconciling_twice_writes_once() {
    let system = account_system(10);
    assert_eq!(reconcile(&system, 75).writes(), 1);
    assert_eq!(reconcile(&system, 75), BalanceOutcome::Unchanged);
    assert_eq!(system.calls().balance_sets, 1);
}

#[test]
fn engine_sets_balances_after_creation() {
    let h = Harness::new(source_with(
        EntityKind::GiftCard,
        [gift_card("g-1", "GIFT-1", "25.50")],
    ));
    let summary = h.migrate();
    assert_eq!(summary.per_kind[&EntityKind::GiftCard].corrective_writes, 1);

    let card = &h.destination.entities(EntityKind::GiftCard)[0];
    let id = card["id"].as_str().unwrap();
    assert_eq!(h.destination.balance(EntityKind::GiftCard, id).unwrap().points, 2550);
}
