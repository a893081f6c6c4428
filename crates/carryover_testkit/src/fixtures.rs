//! Test fixtures and engine helpers.
//!
//! A [`Harness`] wires a source and a destination [`MemorySystem`] to one
//! ledger, so a test only describes the source data and asserts on the
//! outcome.

use carryover_engine::{
    EngineConfig, MemorySystem, MigrationEngine, MigrationSummary, RemoteSystem, StageReport,
    StaticRegistry,
};
use carryover_ledger::{
    EntityKind, Ledger, LedgerConfig, MemoryBackend, MigrationRecord, RecordQuery, RecordStatus,
    RetryConfig, SystemId,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Owner every fixture writes for.
pub const OWNER: &str = "acme";

/// The source system ID used by fixtures.
pub fn legacy() -> SystemId {
    SystemId::new("legacy")
}

/// The destination system ID used by fixtures.
pub fn shop() -> SystemId {
    SystemId::new("shop")
}

/// Engine configuration with a negligible settle delay.
pub fn test_config() -> EngineConfig {
    EngineConfig::new(OWNER).with_settle_delay(Duration::from_millis(1))
}

/// An in-memory ledger with a retry budget sized for many threads
/// contending on the same keys.
pub fn shared_ledger() -> Arc<Ledger> {
    let retry = RetryConfig::new(25)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(20));
    let ledger = Ledger::with_backend(
        Box::new(MemoryBackend::new()),
        LedgerConfig::new().with_txn_retry(retry),
    )
    .expect("Failed to open ledger");
    Arc::new(ledger)
}

/// A brand.
pub fn brand(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

/// An unscoped coupon.
pub fn coupon(id: &str, code: &str) -> Value {
    json!({ "id": id, "code": code, "discount": 10 })
}

/// A coupon scoped to one brand.
pub fn brand_coupon(id: &str, code: &str, brand_id: &str) -> Value {
    json!({ "id": id, "code": code, "discount": 10, "brand_id": brand_id })
}

/// A loyalty account with a point balance.
pub fn loyalty_account(id: &str, email: &str, points: i64) -> Value {
    json!({ "id": id, "email": email, "points": points })
}

/// A gift card with a money balance such as `"25.00"`.
pub fn gift_card(id: &str, code: &str, balance: &str) -> Value {
    json!({ "id": id, "code": code, "balance": balance })
}

/// An order for `customer_id` with one line, one payment and one
/// fulfillment.
pub fn order(id: &str, number: &str, customer_id: &str) -> Value {
    json!({
        "id": id,
        "order_number": number,
        "customer_id": customer_id,
        "line_items": [{ "sku": "MUG", "name": "Mug", "quantity": 2 }],
        "payments": [{ "transaction_id": format!("tx-{number}"), "amount": "18.00" }],
        "fulfillments": [{ "line_items": [{ "sku": "MUG", "quantity": 2 }] }]
    })
}

/// A source system holding `items` of one kind.
pub fn source_with(kind: EntityKind, items: impl IntoIterator<Item = Value>) -> MemorySystem {
    MemorySystem::new("legacy").with_entities(kind, items)
}

/// A source system with every kind represented and cross-referenced.
pub fn sample_source() -> MemorySystem {
    MemorySystem::new("legacy")
        .with_entities(EntityKind::Brand, [brand("b-1", "Acme"), brand("b-2", "Globex")])
        .with_entities(
            EntityKind::LoyaltyAccount,
            [
                loyalty_account("u-1", "ann@example.com", 120),
                loyalty_account("u-2", "bob@example.com", 0),
            ],
        )
        .with_entities(EntityKind::GiftCard, [gift_card("g-1", "GIFT-1", "25.00")])
        .with_entities(
            EntityKind::InfoSection,
            [json!({ "id": "i-1", "handle": "shipping", "title": "Shipping", "brand_id": "b-1" })],
        )
        .with_entities(
            EntityKind::Coupon,
            [
                brand_coupon("c-1", "SAVE10", "b-1"),
                coupon("c-2", "WELCOME"),
                brand_coupon("c-3", "GLOBEX5", "b-2"),
            ],
        )
        .with_entities(EntityKind::Order, [order("o-1", "1001", "u-1")])
}

/// Number of entities in [`sample_source`].
pub const SAMPLE_ENTITIES: usize = 10;

/// An engine wired to a source, a destination and a shared ledger.
pub struct Harness {
    /// The shared ledger.
    pub ledger: Arc<Ledger>,
    /// The source system (`legacy`).
    pub source: Arc<MemorySystem>,
    /// The destination system (`shop`).
    pub destination: Arc<MemorySystem>,
    /// Engine using [`test_config`].
    pub engine: MigrationEngine,
}

impl Harness {
    /// Creates a harness over `source`, an empty destination and an
    /// in-memory ledger.
    pub fn new(source: MemorySystem) -> Self {
        Self::with_parts(
            Arc::new(Ledger::in_memory()),
            Arc::new(source),
            Arc::new(MemorySystem::new("shop")),
            test_config(),
        )
    }

    /// Creates a harness from existing parts.
    pub fn with_parts(
        ledger: Arc<Ledger>,
        source: Arc<MemorySystem>,
        destination: Arc<MemorySystem>,
        config: EngineConfig,
    ) -> Self {
        let engine = engine_over(&ledger, &source, &destination, config);
        Self {
            ledger,
            source,
            destination,
            engine,
        }
    }

    /// Another engine over the same ledger and systems.
    pub fn engine_with(&self, config: EngineConfig) -> MigrationEngine {
        engine_over(&self.ledger, &self.source, &self.destination, config)
    }

    /// Stages the source export.
    pub fn stage(&self) -> StageReport {
        self.engine.stage_export(&legacy()).expect("staging failed")
    }

    /// Runs a full migration.
    pub fn migrate(&self) -> MigrationSummary {
        self.engine
            .run_migration(&legacy(), &shop(), None)
            .expect("migration failed")
    }

    /// Records of `kind`, in ID order.
    pub fn records(&self, kind: EntityKind) -> Vec<MigrationRecord> {
        self.ledger.query(&RecordQuery::new().kind(kind))
    }

    /// Records of `kind` with `status`.
    pub fn records_with(&self, kind: EntityKind, status: RecordStatus) -> Vec<MigrationRecord> {
        self.ledger.query(&RecordQuery::new().kind(kind).status(status))
    }

    /// Asserts the ledger invariants hold.
    pub fn assert_consistent(&self) {
        let report = self.ledger.verify();
        assert!(report.is_ok(), "ledger violations: {:?}", report.violations);
    }
}

fn engine_over(
    ledger: &Arc<Ledger>,
    source: &Arc<MemorySystem>,
    destination: &Arc<MemorySystem>,
    config: EngineConfig,
) -> MigrationEngine {
    let registry = StaticRegistry::new()
        .with(Arc::clone(source) as Arc<dyn RemoteSystem>)
        .with(Arc::clone(destination) as Arc<dyn RemoteSystem>);
    MigrationEngine::new(Arc::clone(ledger), Arc::new(registry), config)
}

/// A ledger file in a temporary directory, removed on drop.
pub struct TempLedger {
    dir: TempDir,
    path: PathBuf,
}

impl TempLedger {
    /// Creates the directory; the log file is created on first open.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("ledger.log");
        Self { dir, path }
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The temporary directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Opens the ledger without syncing on commit.
    pub fn open(&self) -> Ledger {
        Ledger::open(&self.path, LedgerConfig::new().sync_on_commit(false))
            .expect("Failed to open ledger")
    }

    /// Appends raw bytes to the log, as an interrupted write would.
    pub fn append_raw(&self, bytes: &[u8]) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .expect("Failed to open ledger file");
        file.write_all(bytes).expect("Failed to append");
    }

    /// Size of the log file in bytes.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for TempLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_source_counts() {
        let source = sample_source();
        let total: usize = EntityKind::ALL
            .iter()
            .map(|kind| source.entities(*kind).len())
            .sum();
        assert_eq!(total, SAMPLE_ENTITIES);
    }

    #[test]
    fn harness_stages_every_kind() {
        let h = Harness::new(sample_source());
        let report = h.stage();
        assert_eq!(report.rows_staged(), SAMPLE_ENTITIES);
        assert_eq!(h.ledger.len(), SAMPLE_ENTITIES);
    }

    #[test]
    fn temp_ledger_reopens() {
        let temp = TempLedger::new();
        {
            let ledger = temp.open();
            assert!(ledger.is_empty());
        }
        assert!(temp.path().exists());
        assert!(temp.open().is_empty());
    }
}
