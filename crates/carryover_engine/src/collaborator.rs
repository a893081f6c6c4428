//! Capability interfaces for source and destination systems.
//!
//! The engine never builds requests for a specific remote API. It talks to
//! every system through [`RemoteSystem`] and the optional capabilities a
//! system exposes ([`BalanceService`], [`OrderLedger`]).

use crate::error::{EngineError, EngineResult};
use carryover_ledger::{EntityKind, SystemId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One page of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Entities on this page.
    pub items: Vec<Value>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl Page {
    /// A final page holding `items`.
    #[must_use]
    pub fn last(items: Vec<Value>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Result of a natural-key lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The entity exists.
    Found(Value),
    /// No entity has this key.
    NotFound,
}

/// A source or destination system.
pub trait RemoteSystem: Send + Sync {
    /// The system's ID.
    fn id(&self) -> &SystemId;

    /// Lists one page of a collection.
    fn list(&self, kind: EntityKind, cursor: Option<&str>, limit: usize) -> EngineResult<Page>;

    /// Creates one entity and returns the system's result object.
    fn create(&self, kind: EntityKind, payload: &Value) -> EngineResult<Value>;

    /// Creates several entities in one call.
    ///
    /// Returns one result object per payload, in payload order. An `Err`
    /// means the call failed as a whole. The default calls [`create`] per
    /// payload and reports each failure in the result object.
    ///
    /// [`create`]: RemoteSystem::create
    fn bulk_create(&self, kind: EntityKind, payloads: &[Value]) -> EngineResult<Vec<Value>> {
        Ok(create_each(self, kind, payloads))
    }

    /// Finds an entity by its normalized natural key.
    fn find_by_natural_key(&self, kind: EntityKind, key: &str) -> EngineResult<Lookup> {
        let _ = key;
        Err(EngineError::Unsupported(format!(
            "{} has no natural-key lookup for {}",
            self.id(),
            kind.collection()
        )))
    }

    /// Point and gift card balances, if the system keeps them.
    fn balances(&self) -> Option<&dyn BalanceService> {
        None
    }

    /// Order payments and fulfillments, if the system keeps them.
    fn orders(&self) -> Option<&dyn OrderLedger> {
        None
    }
}

/// Creates `payloads` one at a time, in order.
///
/// An item whose create fails becomes a failed result at its position, so
/// items created before it keep their ids.
pub fn create_each<S: RemoteSystem + ?Sized>(system: &S, kind: EntityKind, payloads: &[Value]) -> Vec<Value> {
    payloads
        .iter()
        .map(|payload| match system.create(kind, payload) {
            Ok(result) => result,
            Err(err) => json!({ "success": false, "error": err.record_message() }),
        })
        .collect()
}

/// A balance and the revision guarding it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Balance in the smallest unit (points, or cents for gift cards).
    pub points: i64,
    /// Optimistic-concurrency revision.
    pub revision: u64,
}

/// Balances with optimistic concurrency.
pub trait BalanceService: Send + Sync {
    /// Reads the current balance of an entity.
    fn read_balance(&self, kind: EntityKind, entity_id: &str) -> EngineResult<BalanceSnapshot>;

    /// Sets an absolute balance if the revision still matches.
    ///
    /// A stale revision yields [`EngineError::ConcurrencyConflict`].
    fn set_balance(
        &self,
        kind: EntityKind,
        entity_id: &str,
        points: i64,
        expected_revision: u64,
    ) -> EngineResult<BalanceSnapshot>;

    /// Adds `delta` to the balance, whatever its revision.
    fn adjust_balance(&self, kind: EntityKind, entity_id: &str, delta: i64) -> EngineResult<BalanceSnapshot>;
}

/// A line item of a destination order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Line item ID in the destination.
    pub id: String,
    /// Product SKU.
    pub sku: Option<String>,
    /// Product name.
    pub name: Option<String>,
    /// Ordered quantity.
    pub quantity: u32,
    /// Quantity already fulfilled.
    pub fulfilled_quantity: u32,
}

/// Payments and fulfillments of destination orders.
pub trait OrderLedger: Send + Sync {
    /// Payments already recorded on an order.
    fn list_payments(&self, order_id: &str) -> EngineResult<Vec<Value>>;

    /// Records a payment on an order.
    fn create_payment(&self, order_id: &str, payment: &Value) -> EngineResult<Value>;

    /// Line items of an order with their fulfilled quantities.
    fn order_lines(&self, order_id: &str) -> EngineResult<Vec<OrderLine>>;

    /// Records a fulfillment on an order.
    fn create_fulfillment(&self, order_id: &str, fulfillment: &Value) -> EngineResult<Value>;
}

/// Supplies access tokens. Acquiring and caching them happens elsewhere.
pub trait TokenProvider: Send + Sync {
    /// Token for `system`, if one is available.
    fn token(&self, system: &SystemId) -> Option<String>;
}

/// A token provider that never has a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTokens;

impl TokenProvider for NoTokens {
    fn token(&self, _system: &SystemId) -> Option<String> {
        None
    }
}

/// Resolves system IDs to connected collaborators.
pub trait SystemRegistry: Send + Sync {
    /// Connects to `system`. A missing token is passed through; the system
    /// decides whether anonymous access is allowed.
    fn connect(&self, system: &SystemId, token: Option<String>) -> EngineResult<Arc<dyn RemoteSystem>>;
}

/// A registry over already-connected systems.
#[derive(Default, Clone)]
pub struct StaticRegistry {
    systems: HashMap<SystemId, Arc<dyn RemoteSystem>>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a system under its own ID.
    #[must_use]
    pub fn with(mut self, system: Arc<dyn RemoteSystem>) -> Self {
        self.insert(system);
        self
    }

    /// Registers a system under its own ID.
    pub fn insert(&mut self, system: Arc<dyn RemoteSystem>) {
        self.systems.insert(system.id().clone(), system);
    }
}

impl std::fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticRegistry")
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SystemRegistry for StaticRegistry {
    fn connect(&self, system: &SystemId, _token: Option<String>) -> EngineResult<Arc<dyn RemoteSystem>> {
        self.systems
            .get(system)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSystem(system.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Echo {
        id: SystemId,
        calls: Mutex<usize>,
    }

    impl RemoteSystem for Echo {
        fn id(&self) -> &SystemId {
            &self.id
        }

        fn list(&self, _kind: EntityKind, _cursor: Option<&str>, _limit: usize) -> EngineResult<Page> {
            Ok(Page::default())
        }

        fn create(&self, _kind: EntityKind, payload: &Value) -> EngineResult<Value> {
            *self.calls.lock() += 1;
            match payload.get("code").and_then(Value::as_str) {
                Some("BAD") => Err(EngineError::Collaborator("rejected".into())),
                Some(code) => Ok(json!({ "id": format!("d-{code}") })),
                None => Ok(json!({ "success": false, "error": "code required" })),
            }
        }
    }

    #[test]
    fn default_bulk_create_calls_create_per_payload() {
        let system = Echo {
            id: SystemId::new("shop"),
            calls: Mutex::new(0),
        };
        let results = system
            .bulk_create(
                EntityKind::Coupon,
                &[json!({"code": "A"}), json!({"code": "BAD"}), json!({})],
            )
            .unwrap();

        assert_eq!(*system.calls.lock(), 3);
        assert_eq!(results[0]["id"], "d-A");
        assert_eq!(results[1]["success"], false);
        assert_eq!(results[1]["error"], "collaborator error: rejected");
        assert_eq!(results[2]["error"], "code required");
    }

    #[test]
    fn lookup_and_capabilities_default_to_absent() {
        let system = Echo {
            id: SystemId::new("shop"),
            calls: Mutex::new(0),
        };
        assert!(matches!(
            system.find_by_natural_key(EntityKind::Brand, "acme"),
            Err(EngineError::Unsupported(_))
        ));
        assert!(system.balances().is_none());
        assert!(system.orders().is_none());
    }

    #[test]
    fn static_registry_resolves_known_systems() {
        let registry = StaticRegistry::new().with(Arc::new(Echo {
            id: SystemId::new("shop"),
            calls: Mutex::new(0),
        }));
        assert!(registry.connect(&SystemId::new("shop"), None).is_ok());
        assert!(matches!(
            registry.connect(&SystemId::new("nope"), Some("t".into())),
            Err(EngineError::UnknownSystem(_))
        ));
        assert_eq!(NoTokens.token(&SystemId::new("shop")), None);
    }
}
