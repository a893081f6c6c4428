//! Property-based test generators using proptest.
//!
//! Provides strategies for source exports, timestamps in every shape the
//! staging layer accepts, balance cases and payments.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for coupon codes.
pub fn coupon_code_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z]{3,8}[0-9]{0,3}").expect("Invalid regex")
}

/// Strategy for coupon exports with unique source IDs.
///
/// Codes are drawn from a small pool so exports regularly contain
/// natural-key duplicates under different IDs.
pub fn coupon_export_strategy(max_len: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(0usize..6, 1..=max_len.max(1)).prop_map(|codes| {
        codes
            .into_iter()
            .enumerate()
            .map(|(n, code)| json!({ "id": format!("c-{n}"), "code": format!("CODE{code}") }))
            .collect()
    })
}

/// Strategy for instants between 2001 and 2033, to the millisecond.
pub fn instant_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_000_000_000_000i64..2_000_000_000_000).prop_map(|millis| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .expect("millis in range")
    })
}

/// Strategy for an instant and one of its accepted representations.
///
/// Representations without sub-second precision are paired with the
/// instant truncated to the second.
pub fn timestamp_strategy() -> impl Strategy<Value = (DateTime<Utc>, Value)> {
    (instant_strategy(), 0u8..5).prop_map(|(at, shape)| {
        let seconds = Utc
            .timestamp_opt(at.timestamp(), 0)
            .single()
            .expect("seconds in range");
        match shape {
            0 => (at, json!(at.timestamp_millis())),
            1 => (at, json!(at.timestamp_millis().to_string())),
            2 => (seconds, json!(at.timestamp())),
            3 => (at, json!(at.to_rfc3339())),
            _ => (seconds, json!(seconds.format("%Y-%m-%d %H:%M:%S").to_string())),
        }
    })
}

/// Strategy for `(current, desired)` balances where desired is zero, the
/// current balance, or the current balance plus 100.
pub fn balance_case_strategy() -> impl Strategy<Value = (i64, i64)> {
    (0i64..100_000, 0u8..3).prop_map(|(current, pick)| {
        let desired = match pick {
            0 => 0,
            1 => current,
            _ => current + 100,
        };
        (current, desired)
    })
}

/// Strategy for payments, with or without an external identity.
pub fn payment_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of("[a-z0-9]{6,12}"),
        1i64..100_000,
        instant_strategy(),
    )
        .prop_map(|(txn, cents, at)| {
            let amount = format!("{}.{:02}", cents / 100, cents % 100);
            match txn {
                Some(txn) => json!({ "transaction_id": txn, "amount": amount }),
                None => json!({ "amount": amount, "processed_at": at.to_rfc3339() }),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use carryover_engine::parse_timestamp;

    proptest! {
        #[test]
        fn every_timestamp_shape_parses(case in timestamp_strategy()) {
            let (expected, value) = case;
            prop_assert_eq!(parse_timestamp(&value), Some(expected));
        }

        #[test]
        fn exports_have_unique_ids(export in coupon_export_strategy(20)) {
            let mut ids: Vec<&str> = export.iter().map(|c| c["id"].as_str().unwrap()).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), export.len());
        }
    }
}
