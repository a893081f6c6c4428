//! Repeated runs over the same data never create twice.

use carryover_engine::normalize_key;
use carryover_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

#[test]
fn full_catalog_migrates_once() {
    let h = Harness::new(sample_source());
    h.stage();

    let first = h.migrate();
    assert_eq!(first.imported, SAMPLE_ENTITIES);
    assert_eq!(first.failed, 0);
    let created = h.destination.calls().entities_created;
    assert_eq!(created, SAMPLE_ENTITIES);

    h.stage();
    let second = h.migrate();
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped, SAMPLE_ENTITIES);
    assert!(second.per_kind.values().all(|k| k.corrective_writes == 0));
    assert_eq!(h.destination.calls().entities_created, created);
    h.assert_consistent();
}

#[test]
fn references_point_at_destination_ids() {
    let h = Harness::new(sample_source());
    h.migrate();

    let brand_ids: HashSet<String> = h
        .destination
        .entities(EntityKind::Brand)
        .iter()
        .filter_map(|b| b["id"].as_str().map(str::to_string))
        .collect();
    for coupon in h.destination.entities(EntityKind::Coupon) {
        if let Some(brand) = coupon.get("brand_id").and_then(|b| b.as_str()) {
            assert!(brand_ids.contains(brand), "unmapped brand {brand}");
        }
    }

    let order = &h.destination.entities(EntityKind::Order)[0];
    let account = &h.destination.entities(EntityKind::LoyaltyAccount)[0];
    assert_eq!(order["customer_id"], account["id"]);
    assert!(order.get("payments").is_none());
}

#[test]
fn every_key_has_one_success_across_runs() {
    let h = Harness::new(sample_source());
    for _ in 0..3 {
        h.stage();
        h.migrate();
    }

    let mut successes: HashMap<String, usize> = HashMap::new();
    for kind in EntityKind::ALL {
        for record in h.records_with(kind, RecordStatus::Success) {
            let key = record.key().unwrap().to_string();
            *successes.entry(key).or_default() += 1;
        }
    }
    assert_eq!(successes.len(), SAMPLE_ENTITIES);
    assert!(successes.values().all(|n| *n == 1));
    h.assert_consistent();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reruns_never_duplicate_destination_entities(export in coupon_export_strategy(12)) {
        let distinct_codes: HashSet<String> = export
            .iter()
            .map(|c| normalize_key(c["code"].as_str().unwrap()))
            .collect();
        let h = Harness::new(source_with(EntityKind::Coupon, export.clone()));

        h.stage();
        let first = h.migrate();
        prop_assert_eq!(first.imported, export.len());
        prop_assert_eq!(h.destination.entities(EntityKind::Coupon).len(), distinct_codes.len());

        h.stage();
        let second = h.migrate();
        prop_assert_eq!(second.imported, 0);
        prop_assert_eq!(h.destination.entities(EntityKind::Coupon).len(), distinct_codes.len());
        prop_assert!(h.ledger.verify().is_ok());
    }
}
