//! # Carryover Engine
//!
//! Idempotent migration of entity collections between external systems.
//!
//! A run moves every entity kind through the same pipeline:
//!
//! 1. **Staging** pages through the source and inserts pending records
//! 2. **Claim/Resolve** hands each item exactly one canonical record
//! 3. **Mapping** rewrites embedded references into destination IDs
//! 4. **Deduplication** links items whose natural key already exists
//! 5. **Bulk submission** creates the rest, chunk by chunk
//! 6. **Reconciliation** converges balances, payments and fulfillments
//!
//! Repeated and concurrent runs never create a destination entity twice:
//! the ledger keeps one canonical terminal record per key.
//!
//! ## Example
//!
//! ```rust
//! use carryover_engine::{EngineConfig, MemorySystem, MigrationEngine, RemoteSystem, StaticRegistry};
//! use carryover_ledger::{EntityKind, Ledger, SystemId};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let legacy = Arc::new(
//!     MemorySystem::new("legacy")
//!         .with_entities(EntityKind::Coupon, [json!({"id": "c-1", "code": "SAVE10"})]),
//! );
//! let shop = Arc::new(MemorySystem::new("shop"));
//! let registry = StaticRegistry::new()
//!     .with(legacy as Arc<dyn RemoteSystem>)
//!     .with(Arc::clone(&shop) as Arc<dyn RemoteSystem>);
//!
//! let engine = MigrationEngine::new(
//!     Arc::new(Ledger::in_memory()),
//!     Arc::new(registry),
//!     EngineConfig::new("acme"),
//! );
//! engine.stage_export(&SystemId::new("legacy")).unwrap();
//! let summary = engine
//!     .run_migration(&SystemId::new("legacy"), &SystemId::new("shop"), None)
//!     .unwrap();
//!
//! assert_eq!(summary.imported, 1);
//! assert_eq!(shop.entities(EntityKind::Coupon).len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod balance;
mod chunker;
mod claim;
mod collaborator;
mod config;
mod dedupe;
mod engine;
mod entity;
mod error;
mod http;
mod mapper;
mod memory;
mod settlement;
mod staging;

pub use balance::{BalanceOutcome, BalanceReconciler};
pub use chunker::{interpret, interpret_results, submit, ItemResult};
pub use claim::{ClaimCoordinator, Resolution};
pub use collaborator::{
    create_each, BalanceService, BalanceSnapshot, Lookup, NoTokens, OrderLedger, OrderLine, Page, RemoteSystem,
    StaticRegistry, SystemRegistry, TokenProvider,
};
pub use config::{EngineConfig, MappingMode, RetryConfig};
pub use dedupe::{DedupeMode, DestinationIndex};
pub use engine::{KindSummary, MigrationEngine, MigrationSummary, LINKED_MESSAGE};
pub use entity::{
    entity_id, lookup_path, minor_units, normalize_key, quantity, scalar_text, whole_units,
    EntityProfile, RefRole, ReferenceField,
};
pub use error::{EngineError, EngineResult};
pub use http::{HttpClient, HttpRequest, HttpResponse, HttpSystem, Method};
pub use mapper::CrossReferenceMapper;
pub use memory::{BalanceEntry, CallCounts, MemorySnapshot, MemorySystem, RejectRule};
pub use settlement::{missing_payments, payment_signature, plan_fulfillments, settle_order, SettlementReport};
pub use staging::{
    created_at, fetch_all, parse_timestamp, sort_oldest_first, Listing, StageReport, CREATED_AT_PATHS,
};
