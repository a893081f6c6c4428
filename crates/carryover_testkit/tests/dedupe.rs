//! Existing destination entities are linked even when listing stops early.

use carryover_engine::LINKED_MESSAGE;
use carryover_testkit::prelude::*;
use std::sync::Arc;

fn seeded_shop() -> MemorySystem {
    MemorySystem::new("shop").with_entities(
        EntityKind::Coupon,
        [coupon("d-aaa", "AAA"), coupon("d-bbb", "BBB")],
    )
}

fn harness(destination: MemorySystem) -> Harness {
    Harness::with_parts(
        Arc::new(Ledger::in_memory()),
        Arc::new(source_with(EntityKind::Coupon, [coupon("c-1", "BBB")])),
        Arc::new(destination),
        test_config().with_page_size(1).with_page_ceiling(1),
    )
}

#[test]
fn entity_past_the_page_ceiling_is_linked() {
    let h = harness(seeded_shop().with_lookup());
    h.stage();

    let summary = h.migrate();
    assert_eq!(summary.imported, 1);
    assert_eq!(summary.per_kind[&EntityKind::Coupon].linked, 1);
    assert_eq!(h.destination.entities(EntityKind::Coupon).len(), 2);
    assert_eq!(h.destination.calls().entities_created, 0);
    assert!(h.destination.calls().lookups >= 1);

    let record = h.records_with(EntityKind::Coupon, RecordStatus::Success).remove(0);
    assert_eq!(record.destination_entity_id.as_deref(), Some("d-bbb"));
    assert_eq!(record.error_message.as_deref(), Some(LINKED_MESSAGE));
    h.assert_consistent();
}

#[test]
fn entity_inside_the_partial_listing_needs_no_lookup() {
    let h = Harness::with_parts(
        Arc::new(Ledger::in_memory()),
        Arc::new(source_with(EntityKind::Coupon, [coupon("c-1", "aaa")])),
        Arc::new(seeded_shop().with_lookup()),
        test_config().with_page_size(1).with_page_ceiling(1),
    );

    let summary = h.migrate();
    assert_eq!(summary.per_kind[&EntityKind::Coupon].linked, 1);
    assert_eq!(h.destination.calls().lookups, 0);
    assert_eq!(h.destination.entities(EntityKind::Coupon).len(), 2);
}
