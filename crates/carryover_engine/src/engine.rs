//! The migration engine: staging and runs over every entity kind.

use crate::balance::BalanceReconciler;
use crate::chunker::{self, ItemResult};
use crate::claim::{ClaimCoordinator, Resolution};
use crate::collaborator::{NoTokens, RemoteSystem, SystemRegistry, TokenProvider};
use crate::config::EngineConfig;
use crate::dedupe::DestinationIndex;
use crate::entity::{entity_id, normalize_key, EntityProfile};
use crate::error::EngineResult;
use crate::mapper::CrossReferenceMapper;
use crate::settlement::settle_order;
use crate::staging::{fetch_all, sort_oldest_first, stage_kind, StageReport};
use carryover_ledger::{
    EntityKind, Ledger, MigrationRecord, Outcome, RecordId, RecordStatus, RunId, SystemId,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Message stored on records linked to an entity that already existed.
pub const LINKED_MESSAGE: &str = "already existed; linked";

/// Counts for one entity kind in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    /// Records that reached `success`, created or linked.
    pub imported: usize,
    /// Of `imported`, records linked to an existing destination entity.
    pub linked: usize,
    /// Records that reached `failed`.
    pub failed: usize,
    /// Items not processed by this run: invalid, repeated, already settled,
    /// held by another run, or superseded.
    pub skipped: usize,
    /// Balance, payment and fulfillment writes issued.
    pub corrective_writes: usize,
    /// Why the kind could not be processed, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Totals of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    /// The run.
    pub run: RunId,
    /// Source system.
    pub source: SystemId,
    /// Destination system.
    pub destination: SystemId,
    /// Records that reached `success`.
    pub imported: usize,
    /// Records that reached `failed`.
    pub failed: usize,
    /// Items skipped.
    pub skipped: usize,
    /// Per-kind breakdown.
    pub per_kind: BTreeMap<EntityKind, KindSummary>,
}

impl MigrationSummary {
    fn new(run: RunId, source: SystemId, destination: SystemId) -> Self {
        Self {
            run,
            source,
            destination,
            imported: 0,
            failed: 0,
            skipped: 0,
            per_kind: BTreeMap::new(),
        }
    }

    fn add(&mut self, kind: EntityKind, summary: KindSummary) {
        self.imported += summary.imported;
        self.failed += summary.failed;
        self.skipped += summary.skipped;
        self.per_kind.insert(kind, summary);
    }
}

/// Stages exports and migrates them between systems.
///
/// Runs are sequential inside; several runs may share one ledger from
/// different threads.
pub struct MigrationEngine {
    ledger: Arc<Ledger>,
    registry: Arc<dyn SystemRegistry>,
    tokens: Arc<dyn TokenProvider>,
    config: EngineConfig,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    /// Creates an engine without tokens.
    pub fn new(ledger: Arc<Ledger>, registry: Arc<dyn SystemRegistry>, config: EngineConfig) -> Self {
        Self {
            ledger,
            registry,
            tokens: Arc::new(NoTokens),
            config,
        }
    }

    /// Uses `tokens` when connecting to systems.
    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    /// The ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn connect(&self, system: &SystemId) -> EngineResult<Arc<dyn RemoteSystem>> {
        let token = self.tokens.token(system);
        if token.is_none() {
            debug!(system = %system, "no token, connecting anonymously");
        }
        self.registry.connect(system, token)
    }

    /// Stages every kind of `system`'s export as pending records.
    ///
    /// A kind whose listing fails is logged and left out of the report.
    ///
    /// # Errors
    ///
    /// Returns an error if the system is unknown or the ledger fails.
    pub fn stage_export(&self, system: &SystemId) -> EngineResult<StageReport> {
        let source = self.connect(system)?;
        let mut report = StageReport::default();
        for kind in EntityKind::ALL {
            match stage_kind(&self.ledger, source.as_ref(), kind, &self.config) {
                Ok((staged, rejected)) => {
                    report.staged.insert(kind, staged);
                    report.rejected.insert(kind, rejected);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(system = %system, kind = %kind, error = %err, "cannot stage kind"),
            }
        }
        info!(
            system = %system,
            staged = report.rows_staged(),
            rejected = report.rows_rejected(),
            "export staged"
        );
        Ok(report)
    }

    /// Migrates every kind from `source` to `destination`, referenced kinds
    /// first.
    ///
    /// `max` caps the number of items claimed by the run across all kinds.
    /// Item failures are counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a system is unknown, the ledger fails, or a
    /// claim transaction exhausts its retries.
    pub fn run_migration(
        &self,
        source: &SystemId,
        destination: &SystemId,
        max: Option<usize>,
    ) -> EngineResult<MigrationSummary> {
        let source_system = self.connect(source)?;
        let destination_system = self.connect(destination)?;
        let run = RunId::new();
        info!(run = %run, source = %source, destination = %destination, "migration started");

        let mut budget = max;
        let mut summary = MigrationSummary::new(run, source.clone(), destination.clone());
        for kind in EntityKind::ALL {
            let kind_summary = KindRun::new(
                self,
                run,
                source_system.as_ref(),
                destination_system.as_ref(),
                kind,
            )
            .run(&mut budget)?;
            summary.add(kind, kind_summary);
        }

        info!(
            run = %run,
            imported = summary.imported,
            failed = summary.failed,
            skipped = summary.skipped,
            "migration finished"
        );
        Ok(summary)
    }

    /// Migrates a single kind.
    ///
    /// # Errors
    ///
    /// As [`run_migration`](Self::run_migration).
    pub fn run_kind(
        &self,
        source: &SystemId,
        destination: &SystemId,
        kind: EntityKind,
        max: Option<usize>,
    ) -> EngineResult<KindSummary> {
        let source_system = self.connect(source)?;
        let destination_system = self.connect(destination)?;
        let run = RunId::new();
        let mut budget = max;
        KindRun::new(
            self,
            run,
            source_system.as_ref(),
            destination_system.as_ref(),
            kind,
        )
        .run(&mut budget)
    }
}

/// A record waiting for its chunk, with the items that share its natural key.
struct Queued {
    record: MigrationRecord,
    item: Value,
    payload: Value,
    key: String,
    followers: Vec<(MigrationRecord, Value)>,
}

/// One kind of one run.
struct KindRun<'a> {
    engine: &'a MigrationEngine,
    source: &'a dyn RemoteSystem,
    destination: &'a dyn RemoteSystem,
    kind: EntityKind,
    profile: &'static EntityProfile,
    coordinator: ClaimCoordinator<'a>,
    mapper: CrossReferenceMapper<'a>,
    queue: Vec<Queued>,
    queued_keys: HashMap<String, usize>,
    seen: HashSet<String>,
    summary: KindSummary,
}

impl<'a> KindRun<'a> {
    fn new(
        engine: &'a MigrationEngine,
        run: RunId,
        source: &'a dyn RemoteSystem,
        destination: &'a dyn RemoteSystem,
        kind: EntityKind,
    ) -> Self {
        let config = &engine.config;
        Self {
            engine,
            source,
            destination,
            kind,
            profile: EntityProfile::for_kind(kind),
            coordinator: ClaimCoordinator::new(
                &engine.ledger,
                config.owner.clone(),
                source.id().clone(),
                destination.id().clone(),
                run,
                config.claim_lease_chrono(),
            ),
            mapper: CrossReferenceMapper::new(
                &engine.ledger,
                config.owner.clone(),
                source.id().clone(),
                destination.id().clone(),
            ),
            queue: Vec::new(),
            queued_keys: HashMap::new(),
            seen: HashSet::new(),
            summary: KindSummary::default(),
        }
    }

    fn run(mut self, budget: &mut Option<usize>) -> EngineResult<KindSummary> {
        if *budget == Some(0) {
            return Ok(self.summary);
        }
        let engine = self.engine;
        let config = &engine.config;
        let mut items = match fetch_all(self.source, self.kind, config) {
            Ok(listing) => listing.items,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "cannot list source, kind not migrated");
                self.summary.error = Some(err.record_message());
                return Ok(self.summary);
            }
        };
        if items.is_empty() {
            return Ok(self.summary);
        }
        sort_oldest_first(&mut items);

        let mut index = DestinationIndex::build(self.destination, self.kind, config);
        for item in items {
            if *budget == Some(0) {
                debug!(kind = %self.kind, "item budget exhausted");
                break;
            }
            if self.process(item, &mut index, budget)? && self.queue.len() >= config.chunk_size {
                self.flush(&mut index)?;
            }
        }
        self.flush(&mut index)?;

        info!(
            kind = %self.kind,
            imported = self.summary.imported,
            linked = self.summary.linked,
            failed = self.summary.failed,
            skipped = self.summary.skipped,
            "kind migrated"
        );
        Ok(self.summary)
    }

    /// Takes one source item up to the point where it is queued for
    /// creation or settled. Returns true if it was queued.
    fn process(
        &mut self,
        item: Value,
        index: &mut DestinationIndex<'_>,
        budget: &mut Option<usize>,
    ) -> EngineResult<bool> {
        let (Some(source_id), Some(name)) = (entity_id(&item), self.profile.natural_key(&item)) else {
            debug!(kind = %self.kind, "source item without id or natural key, skipped");
            self.summary.skipped += 1;
            return Ok(false);
        };
        if !self.seen.insert(source_id.clone()) {
            debug!(kind = %self.kind, entity = %source_id, "source id repeated in listing, skipped");
            self.summary.skipped += 1;
            return Ok(false);
        }

        if let Some(left) = budget.as_mut() {
            *left -= 1;
        }
        let claimed = self
            .coordinator
            .claim_or_create(self.kind, &source_id, Some(&name))?;
        let record = match self.coordinator.resolve(&claimed)? {
            Resolution::Active(record) => record,
            Resolution::Settled(canonical) => {
                debug!(kind = %self.kind, entity = %source_id, canonical = %canonical.id, "already settled");
                self.summary.skipped += 1;
                if canonical.status == RecordStatus::Success {
                    if let Some(destination_id) = &canonical.destination_entity_id {
                        self.reconcile(canonical.id, destination_id, &item);
                    }
                }
                return Ok(false);
            }
            Resolution::Busy(holder) => {
                debug!(kind = %self.kind, entity = %source_id, holder = %holder.id, "held by another run");
                self.summary.skipped += 1;
                return Ok(false);
            }
        };

        let mode = self.engine.config.mapping_mode;
        let payload = match self
            .mapper
            .map_payload(self.profile, self.profile.create_payload(&item), mode)
        {
            Ok(payload) => payload,
            Err(err) => {
                self.finish(&record, Outcome::failed(err.record_message()), false)?;
                return Ok(false);
            }
        };

        let key = normalize_key(&name);
        if let Some(existing) = index.find(&key) {
            let outcome = linked(&existing);
            if let Some(done) = self.finish(&record, outcome, true)? {
                self.reconcile(done.id, &existing, &item);
            }
            return Ok(false);
        }

        if let Some(&leader) = self.queued_keys.get(&key) {
            debug!(kind = %self.kind, entity = %source_id, key = %key, "natural key repeated in run, following first item");
            self.queue[leader].followers.push((record, item));
            return Ok(false);
        }
        self.queued_keys.insert(key.clone(), self.queue.len());
        self.queue.push(Queued {
            record,
            item,
            payload,
            key,
            followers: Vec::new(),
        });
        Ok(true)
    }

    /// Submits the queue as one chunk and completes every queued record.
    fn flush(&mut self, index: &mut DestinationIndex<'_>) -> EngineResult<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        self.queued_keys.clear();

        let payloads: Vec<Value> = queue.iter().map(|queued| queued.payload.clone()).collect();
        let results = chunker::submit(
            self.destination,
            self.kind,
            &payloads,
            self.engine.config.chunk_size,
        );

        for (queued, result) in queue.into_iter().zip(results) {
            match result {
                ItemResult::Created(destination_id) => {
                    index.insert(queued.key.clone(), destination_id.clone());
                    if let Some(done) =
                        self.finish(&queued.record, Outcome::success(destination_id.clone()), false)?
                    {
                        self.reconcile(done.id, &destination_id, &queued.item);
                    }
                    for (follower, item) in queued.followers {
                        if let Some(done) = self.finish(&follower, linked(&destination_id), true)? {
                            self.reconcile(done.id, &destination_id, &item);
                        }
                    }
                }
                ItemResult::Failed(message) => {
                    self.finish(&queued.record, Outcome::failed(message.clone()), false)?;
                    for (follower, _) in queued.followers {
                        self.finish(&follower, Outcome::failed(message.clone()), false)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies the terminal update and counts it. Returns the record if it
    /// ended in `success`.
    fn finish(
        &mut self,
        record: &MigrationRecord,
        outcome: Outcome,
        linked: bool,
    ) -> EngineResult<Option<MigrationRecord>> {
        let done = self.coordinator.complete(record, outcome)?;
        match done.status {
            RecordStatus::Success => {
                self.summary.imported += 1;
                if linked {
                    self.summary.linked += 1;
                }
                return Ok(Some(done));
            }
            RecordStatus::Failed => {
                debug!(
                    record = %done.id,
                    error = done.error_message.as_deref().unwrap_or_default(),
                    "item failed"
                );
                self.summary.failed += 1;
            }
            RecordStatus::Skipped | RecordStatus::Pending => self.summary.skipped += 1,
        }
        Ok(None)
    }

    /// Post-creation convergence of balances, payments and fulfillments.
    /// Failures are logged against the record and never change its status.
    fn reconcile(&mut self, record: RecordId, destination_id: &str, item: &Value) {
        let engine = self.engine;
        let config = &engine.config;
        if let (Some(desired), Some(service)) =
            (self.profile.desired_balance(item), self.destination.balances())
        {
            let reconciler = BalanceReconciler::new(service, config.verify_reads, config.settle_delay);
            match reconciler.reconcile(self.kind, destination_id, desired) {
                Ok(outcome) => self.summary.corrective_writes += outcome.writes() as usize,
                Err(err) => warn!(
                    record = %record,
                    kind = %self.kind,
                    error = %err,
                    "balance reconciliation failed"
                ),
            }
        }

        if self.kind == EntityKind::Order {
            if let Some(orders) = self.destination.orders() {
                match settle_order(orders, destination_id, item) {
                    Ok(report) => self.summary.corrective_writes += report.writes(),
                    Err(err) => warn!(
                        record = %record,
                        error = %err,
                        "order settlement failed"
                    ),
                }
            }
        }
    }
}

fn linked(destination_id: &str) -> Outcome {
    Outcome::Success {
        destination_entity_id: destination_id.to_string(),
        message: Some(LINKED_MESSAGE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::StaticRegistry;
    use crate::config::MappingMode;
    use crate::memory::MemorySystem;
    use carryover_ledger::RecordQuery;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: MigrationEngine,
        source: Arc<MemorySystem>,
        shop: Arc<MemorySystem>,
    }

    fn fixture(source: MemorySystem, config: EngineConfig) -> Fixture {
        let source = Arc::new(source);
        let shop = Arc::new(MemorySystem::new("shop"));
        let registry = StaticRegistry::new()
            .with(Arc::clone(&source) as Arc<dyn RemoteSystem>)
            .with(Arc::clone(&shop) as Arc<dyn RemoteSystem>);
        let engine = MigrationEngine::new(Arc::new(Ledger::in_memory()), Arc::new(registry), config);
        Fixture { engine, source, shop }
    }

    fn config() -> EngineConfig {
        EngineConfig::new("acme").with_settle_delay(Duration::from_millis(1))
    }

    fn legacy() -> SystemId {
        SystemId::new("legacy")
    }

    fn shop() -> SystemId {
        SystemId::new("shop")
    }

    #[test]
    fn migrates_and_maps_references() {
        let source = MemorySystem::new("legacy")
            .with_entities(EntityKind::Brand, [json!({"id": "b-1", "name": "Acme"})])
            .with_entities(
                EntityKind::Coupon,
                [
                    json!({"id": "c-1", "code": "SAVE10", "brand_id": "b-1"}),
                    json!({"id": "c-2", "code": "ALL5", "applies_to": "all", "brand_ids": ["b-1"]}),
                ],
            );
        let f = fixture(source, config());

        let summary = f.engine.run_migration(&legacy(), &shop(), None).unwrap();
        assert_eq!((summary.imported, summary.failed, summary.skipped), (3, 0, 0));

        let brand_id = f.shop.entities(EntityKind::Brand)[0]["id"].clone();
        let coupons = f.shop.entities(EntityKind::Coupon);
        assert_eq!(coupons[0]["brand_id"], brand_id);
        assert!(coupons[1].get("brand_ids").is_none());
        assert!(coupons.iter().all(|c| c.get("id") != Some(&json!("c-1"))));
        assert!(f.engine.ledger().verify().is_ok());
    }

    #[test]
    fn unmapped_references_fail_before_creation() {
        let source = MemorySystem::new("legacy").with_entities(
            EntityKind::Coupon,
            [json!({"id": "c-1", "code": "SAVE10", "brand_id": "missing"})],
        );
        let f = fixture(source, config());

        let summary = f.engine.run_kind(&legacy(), &shop(), EntityKind::Coupon, None).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(f.shop.calls().entities_created, 0);

        let failed = f.engine.ledger().query(&RecordQuery::new().status(RecordStatus::Failed));
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("brand_id missing"));
    }

    #[test]
    fn lenient_mode_widens_scope() {
        let source = MemorySystem::new("legacy").with_entities(
            EntityKind::Coupon,
            [json!({"id": "c-1", "code": "SAVE10", "brand_id": "missing"})],
        );
        let f = fixture(source, config().with_mapping_mode(MappingMode::Lenient));

        let summary = f.engine.run_kind(&legacy(), &shop(), EntityKind::Coupon, None).unwrap();
        assert_eq!(summary.imported, 1);
        assert!(f.shop.entities(EntityKind::Coupon)[0].get("brand_id").is_none());
    }

    #[test]
    fn repeated_keys_and_ids_in_one_run() {
        let source = MemorySystem::new("legacy").with_entities(
            EntityKind::Coupon,
            [
                json!({"id": "c-1", "code": "SAVE10"}),
                json!({"id": "c-2", "code": "save10 "}),
                json!({"id": "c-1", "code": "SAVE10"}),
                json!({"code": "NOID"}),
            ],
        );
        let f = fixture(source, config());

        let summary = f.engine.run_kind(&legacy(), &shop(), EntityKind::Coupon, None).unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.linked, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(f.shop.calls().entities_created, 1);
    }

    #[test]
    fn chunks_follow_chunk_size() {
        let coupons: Vec<Value> = (0..5)
            .map(|n| json!({"id": format!("c-{n}"), "code": format!("CODE{n}")}))
            .collect();
        let source = MemorySystem::new("legacy").with_entities(EntityKind::Coupon, coupons);
        let f = fixture(source, config().with_chunk_size(2));
        f.shop.fail_next_bulk_calls(1);

        let summary = f.engine.run_kind(&legacy(), &shop(), EntityKind::Coupon, None).unwrap();
        assert_eq!(f.shop.calls().bulk_creates, 3);
        assert_eq!((summary.imported, summary.failed), (3, 2));

        let failed = f.engine.ledger().query(&RecordQuery::new().status(RecordStatus::Failed));
        assert!(failed
            .iter()
            .all(|r| r.error_message.as_deref().unwrap().contains("service unavailable")));
    }

    #[test]
    fn balances_and_orders_are_reconciled() {
        let source = MemorySystem::new("legacy")
            .with_entities(
                EntityKind::LoyaltyAccount,
                [json!({"id": "u-1", "email": "ann@example.com", "points": 120})],
            )
            .with_entities(
                EntityKind::Order,
                [json!({
                    "id": "o-1",
                    "order_number": "1001",
                    "customer_id": "u-1",
                    "line_items": [{"sku": "MUG", "name": "Mug", "quantity": 2}],
                    "payments": [{"transaction_id": "tx-1", "amount": "18.00"}],
                    "fulfillments": [{"line_items": [{"sku": "MUG", "quantity": 2}]}]
                })],
            );
        let f = fixture(source, config());

        let first = f.engine.run_migration(&legacy(), &shop(), None).unwrap();
        assert_eq!(first.imported, 2);
        assert_eq!(first.per_kind[&EntityKind::LoyaltyAccount].corrective_writes, 1);
        assert_eq!(first.per_kind[&EntityKind::Order].corrective_writes, 2);

        let account = f.shop.entities(EntityKind::LoyaltyAccount)[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(f.shop.balance(EntityKind::LoyaltyAccount, &account).unwrap().points, 120);
        let order = f.shop.entities(EntityKind::Order)[0]["id"].as_str().unwrap().to_string();
        assert!(f.shop.entities(EntityKind::Order)[0].get("payments").is_none());
        assert_eq!(f.shop.payments(&order).len(), 1);

        let rerun = f.engine.run_migration(&legacy(), &shop(), None).unwrap();
        assert_eq!((rerun.imported, rerun.skipped), (0, 2));
        assert_eq!(rerun.per_kind[&EntityKind::Order].corrective_writes, 0);
        assert_eq!(f.shop.calls().entities_created, 2);
        assert_eq!(f.shop.fulfillments(&order).len(), 1);
    }

    #[test]
    fn max_caps_items_claimed() {
        let coupons: Vec<Value> = (0..4)
            .map(|n| json!({"id": format!("c-{n}"), "code": format!("CODE{n}")}))
            .collect();
        let source = MemorySystem::new("legacy").with_entities(EntityKind::Coupon, coupons);
        let f = fixture(source, config());

        let summary = f.engine.run_migration(&legacy(), &shop(), Some(3)).unwrap();
        assert_eq!(summary.imported, 3);
        let rest = f.engine.run_migration(&legacy(), &shop(), None).unwrap();
        assert_eq!((rest.imported, rest.skipped), (1, 3));
        assert_eq!(f.source.calls().entities_created, 0);
    }

    #[test]
    fn listing_failures_are_reported_per_kind() {
        let source = MemorySystem::new("legacy");
        source.fail_listing(true);
        let f = fixture(source, config());

        let summary = f.engine.run_migration(&legacy(), &shop(), None).unwrap();
        assert!(summary.per_kind.values().all(|k| k.error.is_some()));
        assert!(f.engine.run_migration(&legacy(), &SystemId::new("nowhere"), None).is_err());
    }
}
