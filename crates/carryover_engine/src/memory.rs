//! In-memory collaborator.
//!
//! [`MemorySystem`] keeps collections, balances, payments and order lines
//! in process memory. It backs export files and snapshots in the CLI and
//! plays source or destination in tests, with faults that can be switched
//! on per instance.

use crate::collaborator::{
    BalanceService, BalanceSnapshot, Lookup, OrderLedger, OrderLine, Page, RemoteSystem,
};
use crate::entity::{entity_id, quantity, scalar_text, EntityProfile};
use crate::error::{EngineError, EngineResult};
use carryover_ledger::{EntityKind, SystemId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Decides whether a create is rejected, and why.
pub type RejectRule = Box<dyn Fn(EntityKind, &Value) -> Option<String> + Send + Sync>;

/// Calls served, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCounts {
    /// `list` calls.
    pub lists: usize,
    /// Single `create` calls.
    pub creates: usize,
    /// `bulk_create` calls.
    pub bulk_creates: usize,
    /// Entities actually created, by either path.
    pub entities_created: usize,
    /// Natural-key lookups.
    pub lookups: usize,
    /// Balance reads.
    pub balance_reads: usize,
    /// Accepted absolute balance sets.
    pub balance_sets: usize,
    /// Rejected absolute balance sets.
    pub balance_conflicts: usize,
    /// Balance adjustments.
    pub balance_adjusts: usize,
    /// Payments recorded.
    pub payments_created: usize,
    /// Fulfillments recorded.
    pub fulfillments_created: usize,
}

/// A stored balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity ID.
    pub entity_id: String,
    /// Balance in the smallest unit.
    pub points: i64,
    /// Revision.
    pub revision: u64,
}

/// Serializable state of a [`MemorySystem`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Entities per kind.
    #[serde(default)]
    pub collections: BTreeMap<EntityKind, Vec<Value>>,
    /// Balances touched so far.
    #[serde(default)]
    pub balances: Vec<BalanceEntry>,
    /// Payments per order ID.
    #[serde(default)]
    pub payments: BTreeMap<String, Vec<Value>>,
    /// Line items per order ID.
    #[serde(default)]
    pub order_lines: BTreeMap<String, Vec<OrderLine>>,
    /// Fulfillments per order ID.
    #[serde(default)]
    pub fulfillments: BTreeMap<String, Vec<Value>>,
    /// Next generated ID suffix.
    #[serde(default)]
    pub next_id: u64,
}

#[derive(Default)]
struct Faults {
    failing_bulk_calls: usize,
    failing_lists: bool,
    reject: Option<RejectRule>,
    conflicting_sets: usize,
    stale_reads: usize,
    reject_all_sets: bool,
    lookup: bool,
}

type BalanceKey = (EntityKind, String);

#[derive(Default)]
struct Inner {
    collections: BTreeMap<EntityKind, Vec<Value>>,
    balances: HashMap<BalanceKey, BalanceSnapshot>,
    previous: HashMap<BalanceKey, i64>,
    payments: BTreeMap<String, Vec<Value>>,
    lines: BTreeMap<String, Vec<OrderLine>>,
    fulfillments: BTreeMap<String, Vec<Value>>,
    next_id: u64,
    calls: CallCounts,
    faults: Faults,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn find(&self, kind: EntityKind, id: &str) -> Option<&Value> {
        self.collections
            .get(&kind)?
            .iter()
            .find(|item| entity_id(item).as_deref() == Some(id))
    }

    fn create(&mut self, system: &SystemId, kind: EntityKind, payload: &Value) -> Result<String, String> {
        if let Some(reason) = self.faults.reject.as_ref().and_then(|rule| rule(kind, payload)) {
            return Err(reason);
        }
        let id = self.next_id(system.as_str());
        let mut entity = match payload {
            Value::Object(object) => object.clone(),
            _ => return Err("payload must be an object".into()),
        };
        entity.insert("id".into(), Value::String(id.clone()));
        let entity = Value::Object(entity);

        if kind == EntityKind::Order {
            let lines = lines_from(&id, &entity);
            self.lines.insert(id.clone(), lines);
        }
        if !EntityProfile::for_kind(kind).balance_fields.is_empty() {
            // Balances are never taken from the create payload.
            self.balances
                .insert((kind, id.clone()), BalanceSnapshot { points: 0, revision: 1 });
        }
        self.collections.entry(kind).or_default().push(entity);
        self.calls.entities_created += 1;
        Ok(id)
    }

    /// The balance of an entity. Seeded entities start from their own
    /// balance fields; created ones start at zero.
    fn balance(&mut self, kind: EntityKind, id: &str) -> EngineResult<BalanceSnapshot> {
        let key = (kind, id.to_string());
        if let Some(balance) = self.balances.get(&key) {
            return Ok(*balance);
        }
        let entity = self
            .find(kind, id)
            .ok_or_else(|| EngineError::Collaborator(format!("no {kind} with id {id}")))?;
        let points = EntityProfile::for_kind(kind)
            .desired_balance(entity)
            .unwrap_or(0);
        let balance = BalanceSnapshot { points, revision: 1 };
        self.balances.insert(key, balance);
        Ok(balance)
    }

    fn write_balance(&mut self, kind: EntityKind, id: &str, points: i64) -> BalanceSnapshot {
        let key = (kind, id.to_string());
        let entry = self.balances.entry(key.clone()).or_default();
        self.previous.insert(key, entry.points);
        entry.points = points;
        entry.revision += 1;
        *entry
    }

    fn order_lines(&mut self, order_id: &str) -> EngineResult<&mut Vec<OrderLine>> {
        if !self.lines.contains_key(order_id) {
            let order = self.find(EntityKind::Order, order_id).ok_or_else(|| {
                EngineError::Collaborator(format!("no order with id {order_id}"))
            })?;
            let lines = lines_from(order_id, order);
            self.lines.insert(order_id.to_string(), lines);
        }
        self.lines
            .get_mut(order_id)
            .ok_or_else(|| EngineError::Collaborator(format!("no order with id {order_id}")))
    }
}

fn lines_from(order_id: &str, order: &Value) -> Vec<OrderLine> {
    let text = |item: &Value, field: &str| item.get(field).and_then(scalar_text);
    order
        .get("line_items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(n, item)| OrderLine {
                    id: text(item, "id").unwrap_or_else(|| format!("{order_id}-line-{}", n + 1)),
                    sku: text(item, "sku"),
                    name: text(item, "name"),
                    quantity: quantity(item, "quantity"),
                    fulfilled_quantity: quantity(item, "fulfilled_quantity"),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A complete collaborator held in memory.
pub struct MemorySystem {
    id: SystemId,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemorySystem")
            .field("id", &self.id)
            .field(
                "collections",
                &inner
                    .collections
                    .iter()
                    .map(|(kind, items)| (kind.as_str(), items.len()))
                    .collect::<BTreeMap<_, _>>(),
            )
            .field("calls", &inner.calls)
            .finish()
    }
}

impl MemorySystem {
    /// Creates an empty system.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: SystemId::new(id),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Builds a system from an export document.
    ///
    /// The document is an object of collections keyed by kind, plural or
    /// singular (`{"coupons": [...], "brand": [...]}`). Unknown keys are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Collaborator`] if the document is not an
    /// object or a known collection is not an array.
    pub fn from_export(id: impl Into<String>, export: &Value) -> EngineResult<Self> {
        let system = Self::new(id);
        let object = export
            .as_object()
            .ok_or_else(|| EngineError::Collaborator("export must be a JSON object".into()))?;
        for (name, items) in object {
            let Ok(kind) = EntityKind::from_str(name) else {
                debug!(collection = %name, "ignoring unknown export collection");
                continue;
            };
            let items = items.as_array().ok_or_else(|| {
                EngineError::Collaborator(format!("export collection {name} must be an array"))
            })?;
            system.seed(kind, items.iter().cloned());
        }
        Ok(system)
    }

    /// Reads an export document from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Collaborator`] if the file cannot be read or
    /// parsed.
    pub fn load_export(id: impl Into<String>, path: impl AsRef<Path>) -> EngineResult<Self> {
        let export: Value = read_json(path.as_ref())?;
        Self::from_export(id, &export)
    }

    /// Restores a system from a snapshot.
    pub fn from_snapshot(id: impl Into<String>, snapshot: MemorySnapshot) -> Self {
        let system = Self::new(id);
        {
            let mut inner = system.inner.lock();
            inner.collections = snapshot.collections;
            inner.balances = snapshot
                .balances
                .into_iter()
                .map(|entry| {
                    (
                        (entry.kind, entry.entity_id),
                        BalanceSnapshot {
                            points: entry.points,
                            revision: entry.revision,
                        },
                    )
                })
                .collect();
            inner.payments = snapshot.payments;
            inner.lines = snapshot.order_lines;
            inner.fulfillments = snapshot.fulfillments;
            inner.next_id = snapshot.next_id;
        }
        system
    }

    /// Reads a snapshot file. A missing file yields an empty system.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Collaborator`] if the file exists but cannot
    /// be read or parsed.
    pub fn load_snapshot(id: impl Into<String>, path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(id));
        }
        Ok(Self::from_snapshot(id, read_json(path)?))
    }

    /// The current state.
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock();
        let mut balances: Vec<BalanceEntry> = inner
            .balances
            .iter()
            .map(|((kind, entity_id), balance)| BalanceEntry {
                kind: *kind,
                entity_id: entity_id.clone(),
                points: balance.points,
                revision: balance.revision,
            })
            .collect();
        balances.sort_by(|a, b| (a.kind, &a.entity_id).cmp(&(b.kind, &b.entity_id)));
        MemorySnapshot {
            collections: inner.collections.clone(),
            balances,
            payments: inner.payments.clone(),
            order_lines: inner.lines.clone(),
            fulfillments: inner.fulfillments.clone(),
            next_id: inner.next_id,
        }
    }

    /// Writes the current state to a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Collaborator`] if the file cannot be written.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot();
        let file = File::create(path).map_err(|err| {
            EngineError::Collaborator(format!("cannot write {}: {err}", path.display()))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &snapshot).map_err(|err| {
            EngineError::Collaborator(format!("cannot write {}: {err}", path.display()))
        })
    }

    /// Adds existing entities without counting them as created.
    pub fn seed(&self, kind: EntityKind, items: impl IntoIterator<Item = Value>) {
        self.inner
            .lock()
            .collections
            .entry(kind)
            .or_default()
            .extend(items);
    }

    /// Builder form of [`seed`](Self::seed).
    #[must_use]
    pub fn with_entities(self, kind: EntityKind, items: impl IntoIterator<Item = Value>) -> Self {
        self.seed(kind, items);
        self
    }

    /// Sets a balance directly, bumping its revision.
    pub fn seed_balance(&self, kind: EntityKind, entity_id: &str, points: i64) {
        self.inner.lock().write_balance(kind, entity_id, points);
    }

    /// Entities of a kind.
    #[must_use]
    pub fn entities(&self, kind: EntityKind) -> Vec<Value> {
        self.inner
            .lock()
            .collections
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// The stored balance, without counting a read or applying faults.
    #[must_use]
    pub fn balance(&self, kind: EntityKind, entity_id: &str) -> Option<BalanceSnapshot> {
        self.inner.lock().balance(kind, entity_id).ok()
    }

    /// Payments recorded on an order.
    #[must_use]
    pub fn payments(&self, order_id: &str) -> Vec<Value> {
        self.inner
            .lock()
            .payments
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Fulfillments recorded on an order.
    #[must_use]
    pub fn fulfillments(&self, order_id: &str) -> Vec<Value> {
        self.inner
            .lock()
            .fulfillments
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Calls served so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }

    /// Enables natural-key lookups.
    #[must_use]
    pub fn with_lookup(self) -> Self {
        self.inner.lock().faults.lookup = true;
        self
    }

    /// Fails the next `calls` bulk creates as a whole.
    pub fn fail_next_bulk_calls(&self, calls: usize) {
        self.inner.lock().faults.failing_bulk_calls = calls;
    }

    /// Makes every `list` call fail.
    pub fn fail_listing(&self, failing: bool) {
        self.inner.lock().faults.failing_lists = failing;
    }

    /// Rejects creates for which `rule` returns a reason.
    pub fn reject_when<F>(&self, rule: F)
    where
        F: Fn(EntityKind, &Value) -> Option<String> + Send + Sync + 'static,
    {
        self.inner.lock().faults.reject = Some(Box::new(rule));
    }

    /// Rejects the next `sets` absolute balance sets with a revision conflict.
    pub fn conflict_next_sets(&self, sets: usize) {
        self.inner.lock().faults.conflicting_sets = sets;
    }

    /// Rejects every absolute balance set with a revision conflict.
    pub fn reject_all_sets(&self, rejecting: bool) {
        self.inner.lock().faults.reject_all_sets = rejecting;
    }

    /// Serves the next `reads` balance reads from the value before the last
    /// write.
    pub fn stale_next_reads(&self, reads: usize) {
        self.inner.lock().faults.stale_reads = reads;
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let file = File::open(path)
        .map_err(|err| EngineError::Collaborator(format!("cannot read {}: {err}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| EngineError::Collaborator(format!("cannot parse {}: {err}", path.display())))
}

impl RemoteSystem for MemorySystem {
    fn id(&self) -> &SystemId {
        &self.id
    }

    fn list(&self, kind: EntityKind, cursor: Option<&str>, limit: usize) -> EngineResult<Page> {
        let mut inner = self.inner.lock();
        inner.calls.lists += 1;
        if inner.faults.failing_lists {
            return Err(EngineError::transport(
                format!("listing {} failed with HTTP 500", kind.collection()),
                None,
                true,
            ));
        }

        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| EngineError::Collaborator(format!("invalid cursor {cursor:?}")))?,
            None => 0,
        };
        let items = inner.collections.get(&kind).map_or(&[][..], Vec::as_slice);
        let end = offset.saturating_add(limit.max(1)).min(items.len());
        let page = items.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: page,
            next_cursor,
        })
    }

    fn create(&self, kind: EntityKind, payload: &Value) -> EngineResult<Value> {
        let mut inner = self.inner.lock();
        inner.calls.creates += 1;
        Ok(match inner.create(&self.id, kind, payload) {
            Ok(id) => json!({ "success": true, "id": id }),
            Err(reason) => json!({ "success": false, "error": reason }),
        })
    }

    fn bulk_create(&self, kind: EntityKind, payloads: &[Value]) -> EngineResult<Vec<Value>> {
        let mut inner = self.inner.lock();
        inner.calls.bulk_creates += 1;
        if inner.faults.failing_bulk_calls > 0 {
            inner.faults.failing_bulk_calls -= 1;
            return Err(EngineError::transport(
                "bulk create failed with HTTP 503",
                Some(r#"{"error":"service unavailable"}"#.into()),
                true,
            ));
        }
        Ok(payloads
            .iter()
            .map(|payload| match inner.create(&self.id, kind, payload) {
                Ok(id) => json!({ "success": true, "id": id }),
                Err(reason) => json!({ "success": false, "error": reason }),
            })
            .collect())
    }

    fn find_by_natural_key(&self, kind: EntityKind, key: &str) -> EngineResult<Lookup> {
        let mut inner = self.inner.lock();
        if !inner.faults.lookup {
            return Err(EngineError::Unsupported(format!(
                "{} has no natural-key lookup",
                self.id
            )));
        }
        inner.calls.lookups += 1;
        let profile = EntityProfile::for_kind(kind);
        Ok(inner
            .collections
            .get(&kind)
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| profile.normalized_key(item).as_deref() == Some(key))
            })
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    fn balances(&self) -> Option<&dyn BalanceService> {
        Some(self)
    }

    fn orders(&self) -> Option<&dyn OrderLedger> {
        Some(self)
    }
}

impl BalanceService for MemorySystem {
    fn read_balance(&self, kind: EntityKind, entity_id: &str) -> EngineResult<BalanceSnapshot> {
        let mut inner = self.inner.lock();
        inner.calls.balance_reads += 1;
        let current = inner.balance(kind, entity_id)?;
        if inner.faults.stale_reads > 0 {
            inner.faults.stale_reads -= 1;
            if let Some(previous) = inner.previous.get(&(kind, entity_id.to_string())) {
                return Ok(BalanceSnapshot {
                    points: *previous,
                    revision: current.revision,
                });
            }
        }
        Ok(current)
    }

    fn set_balance(
        &self,
        kind: EntityKind,
        entity_id: &str,
        points: i64,
        expected_revision: u64,
    ) -> EngineResult<BalanceSnapshot> {
        let mut inner = self.inner.lock();
        let current = inner.balance(kind, entity_id)?;
        let injected = if inner.faults.conflicting_sets > 0 {
            inner.faults.conflicting_sets -= 1;
            true
        } else {
            inner.faults.reject_all_sets
        };
        if injected || current.revision != expected_revision {
            inner.calls.balance_conflicts += 1;
            return Err(EngineError::ConcurrencyConflict {
                resource: format!("{kind}/{entity_id}"),
                expected: expected_revision,
            });
        }
        inner.calls.balance_sets += 1;
        Ok(inner.write_balance(kind, entity_id, points))
    }

    fn adjust_balance(&self, kind: EntityKind, entity_id: &str, delta: i64) -> EngineResult<BalanceSnapshot> {
        let mut inner = self.inner.lock();
        let current = inner.balance(kind, entity_id)?;
        let points = current
            .points
            .checked_add(delta)
            .ok_or_else(|| EngineError::BalanceOverflow {
                resource: format!("{kind}/{entity_id}"),
                message: format!("{} + {delta}", current.points),
            })?;
        inner.calls.balance_adjusts += 1;
        Ok(inner.write_balance(kind, entity_id, points))
    }
}

impl OrderLedger for MemorySystem {
    fn list_payments(&self, order_id: &str) -> EngineResult<Vec<Value>> {
        Ok(self.payments(order_id))
    }

    fn create_payment(&self, order_id: &str, payment: &Value) -> EngineResult<Value> {
        let mut inner = self.inner.lock();
        if inner.find(EntityKind::Order, order_id).is_none() {
            return Err(EngineError::Collaborator(format!("no order with id {order_id}")));
        }
        let id = inner.next_id("payment");
        let mut stored = payment.clone();
        if let Some(object) = stored.as_object_mut() {
            object.insert("id".into(), Value::String(id));
        }
        inner
            .payments
            .entry(order_id.to_string())
            .or_default()
            .push(stored.clone());
        inner.calls.payments_created += 1;
        Ok(stored)
    }

    fn order_lines(&self, order_id: &str) -> EngineResult<Vec<OrderLine>> {
        Ok(self.inner.lock().order_lines(order_id)?.clone())
    }

    fn create_fulfillment(&self, order_id: &str, fulfillment: &Value) -> EngineResult<Value> {
        let mut inner = self.inner.lock();
        let requested: Vec<(String, u32)> = fulfillment
            .get("line_items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item.get("line_item_id").and_then(scalar_text)?;
                        Some((id, quantity(item, "quantity")))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let lines = inner.order_lines(order_id)?;
        for (line_id, wanted) in &requested {
            let line = lines
                .iter()
                .find(|line| &line.id == line_id)
                .ok_or_else(|| EngineError::Collaborator(format!("no line item {line_id}")))?;
            if line.fulfilled_quantity + wanted > line.quantity {
                return Err(EngineError::Collaborator(format!(
                    "line item {line_id} would be over-fulfilled"
                )));
            }
        }
        for (line_id, wanted) in &requested {
            if let Some(line) = lines.iter_mut().find(|line| &line.id == line_id) {
                line.fulfilled_quantity += wanted;
            }
        }

        let id = inner.next_id("fulfillment");
        let mut stored = fulfillment.clone();
        if let Some(object) = stored.as_object_mut() {
            object.insert("id".into(), Value::String(id));
        }
        inner
            .fulfillments
            .entry(order_id.to_string())
            .or_default()
            .push(stored.clone());
        inner.calls.fulfillments_created += 1;
        Ok(stored)
    }
}
