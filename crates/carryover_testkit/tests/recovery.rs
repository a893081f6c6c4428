//! A crash mid-append never surfaces half a transaction.

use carryover_ledger::{Frame, TxnId};
use carryover_testkit::prelude::*;
use std::sync::Arc;

fn coupons() -> MemorySystem {
    source_with(
        EntityKind::Coupon,
        [coupon("c-1", "SAVE10"), coupon("c-2", "SAVE20"), coupon("c-3", "SAVE30")],
    )
}

fn file_harness(temp: &TempLedger, destination: &Arc<MemorySystem>) -> Harness {
    Harness::with_parts(
        Arc::new(temp.open()),
        Arc::new(coupons()),
        Arc::clone(destination),
        test_config(),
    )
}

#[test]
fn torn_frame_is_cut_and_committed_work_survives() {
    let temp = TempLedger::new();
    let destination = Arc::new(MemorySystem::new("shop"));
    let records = {
        let h = file_harness(&temp, &destination);
        h.stage();
        assert_eq!(h.migrate().imported, 3);
        h.records(EntityKind::Coupon)
    };

    let clean_size = temp.size();
    let frame = Frame::Put {
        txid: TxnId::new(9_999),
        record: records[0].clone(),
    }
    .encode()
    .unwrap();
    temp.append_raw(&frame[..frame.len() / 2]);
    assert!(temp.size() > clean_size);

    let ledger = temp.open();
    assert!(ledger.recovery().truncated_bytes > 0);
    assert_eq!(temp.size(), clean_size);
    assert_eq!(ledger.len(), records.len());
    for record in &records {
        assert_eq!(&ledger.get(record.id).unwrap(), record);
    }
    assert!(ledger.verify().is_ok());
}

#[test]
fn uncommitted_transaction_is_discarded() {
    let temp = TempLedger::new();
    let destination = Arc::new(MemorySystem::new("shop"));
    let records = {
        let h = file_harness(&temp, &destination);
        h.stage();
        h.records(EntityKind::Coupon)
    };

    // A complete begin and put whose commit never made it to disk.
    let mut forged = records[0].clone();
    forged.status = RecordStatus::Failed;
    forged.error_message = Some("never committed".into());
    let txid = TxnId::new(9_999);
    let mut bytes = Frame::Begin { txid }.encode().unwrap();
    bytes.extend(Frame::Put { txid, record: forged }.encode().unwrap());
    temp.append_raw(&bytes);

    let ledger = temp.open();
    assert_eq!(ledger.get(records[0].id).unwrap().status, RecordStatus::Pending);
    assert!(ledger.recovery().truncated_bytes > 0);
}

#[test]
fn rerun_after_crash_does_not_recreate() {
    let temp = TempLedger::new();
    let destination = Arc::new(MemorySystem::new("shop"));
    {
        let h = file_harness(&temp, &destination);
        h.stage();
        h.migrate();
    }
    temp.append_raw(b"CLOG\x01");

    let h = file_harness(&temp, &destination);
    assert!(h.ledger.recovery().truncated_bytes > 0);
    h.stage();
    let summary = h.migrate();
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.skipped, 3);
    assert_eq!(destination.calls().entities_created, 3);
    h.assert_consistent();
}

#[test]
fn pending_records_survive_reopen() {
    let temp = TempLedger::new();
    {
        let h = file_harness(&temp, &Arc::new(MemorySystem::new("shop")));
        h.stage();
    }
    let ledger = temp.open();
    assert_eq!(ledger.recovery().truncated_bytes, 0);
    assert_eq!(
        ledger
            .query(&RecordQuery::new().status(RecordStatus::Pending))
            .len(),
        3
    );
}
