//! Collection reconciliation for orders: payments and fulfillments.

use crate::collaborator::{OrderLedger, OrderLine};
use crate::entity::{minor_units, quantity, scalar_text};
use crate::error::EngineResult;
use crate::staging::parse_timestamp;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const PROVIDER_FIELDS: [&str; 2] = ["provider_transaction_id", "transaction_id"];
const GATEWAY_FIELDS: [&str; 2] = ["gateway_id", "gateway_reference"];
const RECEIPT_FIELDS: [&str; 2] = ["receipt_id", "receipt_number"];
const TIME_FIELDS: [&str; 2] = ["processed_at", "created_at"];

/// Writes issued while settling one order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    /// Payments created.
    pub payments: usize,
    /// Fulfillments created.
    pub fulfillments: usize,
}

impl SettlementReport {
    /// Total corrective writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.payments + self.fulfillments
    }
}

fn first_text(item: &Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|field| item.get(*field).and_then(scalar_text))
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

/// Stable identity of a payment.
///
/// Provider transaction ID, then gateway ID, then receipt ID, then amount
/// with the timestamp truncated to the minute, then amount alone. `None`
/// when the payment has none of these.
#[must_use]
pub fn payment_signature(payment: &Value) -> Option<String> {
    if let Some(id) = first_text(payment, &PROVIDER_FIELDS) {
        return Some(format!("txn:{id}"));
    }
    if let Some(id) = first_text(payment, &GATEWAY_FIELDS) {
        return Some(format!("gateway:{id}"));
    }
    if let Some(id) = first_text(payment, &RECEIPT_FIELDS) {
        return Some(format!("receipt:{id}"));
    }

    let amount = payment.get("amount").and_then(minor_units)?;
    let minute = TIME_FIELDS
        .iter()
        .filter_map(|field| payment.get(*field))
        .find_map(parse_timestamp)
        .map(|at| at.format("%Y-%m-%dT%H:%M").to_string());
    Some(match minute {
        Some(minute) => format!("amount:{amount}@{minute}"),
        None => format!("amount:{amount}"),
    })
}

/// Source payments whose signature the destination does not have yet.
///
/// Duplicates within `source` are returned once. Payments without any
/// signature cannot be matched and are left out.
#[must_use]
pub fn missing_payments(source: &[Value], existing: &[Value]) -> Vec<Value> {
    let mut known: HashSet<String> = existing.iter().filter_map(payment_signature).collect();
    let mut missing = Vec::new();
    for payment in source {
        let Some(signature) = payment_signature(payment) else {
            debug!("payment without identity or amount, not submitted");
            continue;
        };
        if known.insert(signature) {
            let mut payment = payment.clone();
            if let Some(object) = payment.as_object_mut() {
                object.remove("id");
            }
            missing.push(payment);
        }
    }
    missing
}

/// The destination line for a source line item: same SKU, else same name.
fn match_line<'l>(lines: &'l [OrderLine], item: &Value) -> Option<&'l OrderLine> {
    let same = |a: &Option<String>, field: &str| {
        let wanted = item.get(field).and_then(Value::as_str).map(str::trim);
        match (a, wanted) {
            (Some(have), Some(wanted)) if !wanted.is_empty() => have.trim().eq_ignore_ascii_case(wanted),
            _ => false,
        }
    };
    lines
        .iter()
        .find(|line| same(&line.sku, "sku"))
        .or_else(|| lines.iter().find(|line| same(&line.name, "name")))
}

fn source_lines(fulfillment: &Value) -> &[Value] {
    ["line_items", "items"]
        .iter()
        .find_map(|field| fulfillment.get(*field).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Destination fulfillments for the source fulfillments of an order.
///
/// Source line items are remapped to destination lines by SKU, falling back
/// to product name. Each quantity is capped at what is left to fulfil on
/// that line; zero-quantity lines are dropped and a fulfillment left
/// without lines is not planned.
#[must_use]
pub fn plan_fulfillments(source: &[Value], lines: &[OrderLine]) -> Vec<Value> {
    let mut remaining: HashMap<&str, u32> = lines
        .iter()
        .map(|line| (line.id.as_str(), line.quantity.saturating_sub(line.fulfilled_quantity)))
        .collect();

    let mut planned = Vec::new();
    for fulfillment in source {
        let mut mapped = Vec::new();
        for item in source_lines(fulfillment) {
            let Some(line) = match_line(lines, item) else {
                debug!(item = %item, "fulfillment line without a destination match");
                continue;
            };
            let wanted = quantity(item, "quantity");
            let left = remaining.entry(line.id.as_str()).or_insert(0);
            let quantity = wanted.min(*left);
            if quantity == 0 {
                continue;
            }
            *left -= quantity;
            mapped.push(json!({ "line_item_id": line.id, "quantity": quantity }));
        }
        if mapped.is_empty() {
            continue;
        }

        let mut payload = match fulfillment {
            Value::Object(object) => object.clone(),
            _ => Map::new(),
        };
        payload.remove("id");
        payload.remove("items");
        payload.insert("line_items".into(), Value::Array(mapped));
        planned.push(Value::Object(payload));
    }
    planned
}

/// Brings a destination order's payments and fulfillments in line with the
/// source order.
///
/// # Errors
///
/// Returns the order ledger's error; writes issued before it stay applied.
pub fn settle_order(
    orders: &dyn OrderLedger,
    order_id: &str,
    source_order: &Value,
) -> EngineResult<SettlementReport> {
    let mut report = SettlementReport::default();
    let list = |field: &str| {
        source_order
            .get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    let payments = list("payments");
    if !payments.is_empty() {
        let existing = orders.list_payments(order_id)?;
        for payment in missing_payments(&payments, &existing) {
            orders.create_payment(order_id, &payment)?;
            report.payments += 1;
        }
    }

    let fulfillments = list("fulfillments");
    if !fulfillments.is_empty() {
        let lines = orders.order_lines(order_id)?;
        for fulfillment in plan_fulfillments(&fulfillments, &lines) {
            orders.create_fulfillment(order_id, &fulfillment)?;
            report.fulfillments += 1;
        }
    }

    if report.writes() > 0 {
        debug!(
            order = order_id,
            payments = report.payments,
            fulfillments = report.fulfillments,
            "settled order"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line(id: &str, sku: Option<&str>, name: &str, quantity: u32, fulfilled: u32) -> OrderLine {
        OrderLine {
            id: id.into(),
            sku: sku.map(str::to_string),
            name: Some(name.into()),
            quantity,
            fulfilled_quantity: fulfilled,
        }
    }

    #[test]
    fn signature_priority() {
        let full = json!({
            "transaction_id": "tx-1",
            "gateway_id": "gw-1",
            "receipt_id": "r-1",
            "amount": "10.00"
        });
        assert_eq!(payment_signature(&full).as_deref(), Some("txn:tx-1"));
        assert_eq!(
            payment_signature(&json!({"gateway_reference": "gw-1", "amount": 5})).as_deref(),
            Some("gateway:gw-1")
        );
        assert_eq!(
            payment_signature(&json!({"receipt_number": 77})).as_deref(),
            Some("receipt:77")
        );
        assert_eq!(
            payment_signature(&json!({"amount": "12.5", "processed_at": "2024-03-01T10:15:42Z"}))
                .as_deref(),
            Some("amount:1250@2024-03-01T10:15")
        );
        assert_eq!(payment_signature(&json!({"amount": 3})).as_deref(), Some("amount:300"));
        assert_eq!(payment_signature(&json!({"method": "cash"})), None);
    }

    #[test]
    fn amount_and_minute_match_across_shapes() {
        let a = json!({"amount": "19.90", "created_at": "2024-03-01 10:15:05"});
        let b = json!({"amount": 19.9, "processed_at": "2024-03-01T10:15:59Z"});
        assert_eq!(payment_signature(&a), payment_signature(&b));
    }

    #[test]
    fn only_missing_payments_are_planned() {
        let source = vec![
            json!({"id": "p-1", "transaction_id": "tx-1", "amount": 10}),
            json!({"id": "p-2", "transaction_id": "tx-2", "amount": 5}),
            json!({"id": "p-3", "transaction_id": "tx-2", "amount": 5}),
        ];
        let existing = vec![json!({"transaction_id": "tx-1", "amount": 10})];

        let missing = missing_payments(&source, &existing);
        assert_eq!(missing, vec![json!({"transaction_id": "tx-2", "amount": 5})]);
        assert!(missing_payments(&source[1..], &missing).is_empty());
    }

    #[test]
    fn fulfillments_are_remapped_and_capped() {
        let lines = vec![
            line("li-1", Some("SKU-A"), "Mug", 3, 1),
            line("li-2", None, "Poster", 1, 0),
            line("li-3", Some("SKU-C"), "Cap", 2, 2),
        ];
        let source = vec![json!({
            "id": "f-1",
            "tracking_number": "TRK",
            "line_items": [
                {"sku": "sku-a", "name": "Old mug name", "quantity": 5},
                {"name": "poster", "quantity": 1},
                {"sku": "SKU-C", "quantity": 1},
                {"sku": "SKU-X", "quantity": 1}
            ]
        })];

        let planned = plan_fulfillments(&source, &lines);
        assert_eq!(
            planned,
            vec![json!({
                "tracking_number": "TRK",
                "line_items": [
                    {"line_item_id": "li-1", "quantity": 2},
                    {"line_item_id": "li-2", "quantity": 1}
                ]
            })]
        );
    }

    #[test]
    fn string_and_float_quantities_are_read() {
        let lines = vec![
            line("li-1", Some("SKU-A"), "Mug", 3, 0),
            line("li-2", Some("SKU-B"), "Cap", 2, 0),
        ];
        let source = vec![json!({"line_items": [
            {"sku": "SKU-A", "quantity": "2"},
            {"sku": "SKU-B", "quantity": 2.0}
        ]})];

        let planned = plan_fulfillments(&source, &lines);
        assert_eq!(
            planned[0]["line_items"],
            json!([
                {"line_item_id": "li-1", "quantity": 2},
                {"line_item_id": "li-2", "quantity": 2}
            ])
        );
    }

    #[test]
    fn fully_fulfilled_orders_plan_nothing() {
        let lines = vec![line("li-1", Some("SKU-A"), "Mug", 2, 2)];
        let source = vec![json!({"line_items": [{"sku": "SKU-A", "quantity": 2}]})];
        assert!(plan_fulfillments(&source, &lines).is_empty());
    }

    proptest! {
        #[test]
        fn signature_ignores_seconds(cents in 1i64..1_000_000, second in 0u32..60) {
            let amount = format!("{}.{:02}", cents / 100, cents % 100);
            let a = json!({"amount": amount, "processed_at": "2024-05-06T07:08:00Z"});
            let b = json!({"amount": amount, "processed_at": format!("2024-05-06T07:08:{second:02}Z")});
            prop_assert_eq!(payment_signature(&a), payment_signature(&b));
        }

        #[test]
        fn planned_quantities_never_exceed_remaining(
            ordered in 0u32..10,
            fulfilled in 0u32..10,
            wanted in proptest::collection::vec(0u32..10, 1..4),
        ) {
            let lines = vec![line("li-1", Some("SKU"), "Thing", ordered, fulfilled)];
            let source: Vec<Value> = wanted
                .iter()
                .map(|q| json!({"line_items": [{"sku": "SKU", "quantity": q}]}))
                .collect();

            let total: u64 = plan_fulfillments(&source, &lines)
                .iter()
                .flat_map(|f| f["line_items"].as_array().cloned().unwrap_or_default())
                .map(|l| l["quantity"].as_u64().unwrap())
                .sum();
            prop_assert!(total <= u64::from(ordered.saturating_sub(fulfilled)));
        }
    }
}
