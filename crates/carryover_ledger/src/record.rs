//! Migration record model and its state machine.

use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of a migration record.
///
/// Record IDs are assigned by the ledger and increase in insert order. They
/// are unique among committed records; an ID taken by a transaction that
/// aborted may be handed out again after the ledger is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Creates a record ID from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec:{}", self.0)
    }
}

/// The tenant a migration runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the owner ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an external system (a source or a destination).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(String);

impl SystemId {
    /// Creates a system ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the system ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one migration run, used to stamp claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new random run ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run:{}", self.0)
    }
}

/// The entity types the engine knows how to migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Brands (no outgoing references).
    Brand,
    /// Loyalty accounts, keyed by email, carrying a point balance.
    LoyaltyAccount,
    /// Gift cards, keyed by code, carrying a balance.
    GiftCard,
    /// Informational content sections.
    InfoSection,
    /// Coupons, keyed by code, optionally scoped to a brand.
    Coupon,
    /// Orders with payments and fulfillments.
    Order,
}

impl EntityKind {
    /// Every kind, in the order a full migration processes them.
    ///
    /// Referenced kinds come before the kinds that reference them.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Brand,
        EntityKind::LoyaltyAccount,
        EntityKind::GiftCard,
        EntityKind::InfoSection,
        EntityKind::Coupon,
        EntityKind::Order,
    ];

    /// Singular snake-case name, as stored in the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Brand => "brand",
            Self::LoyaltyAccount => "loyalty_account",
            Self::GiftCard => "gift_card",
            Self::InfoSection => "info_section",
            Self::Coupon => "coupon",
            Self::Order => "order",
        }
    }

    /// Plural collection name used by collaborators and export files.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Brand => "brands",
            Self::LoyaltyAccount => "loyalty_accounts",
            Self::GiftCard => "gift_cards",
            Self::InfoSection => "info_sections",
            Self::Coupon => "coupons",
            Self::Order => "orders",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted || kind.collection() == wanted)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// Status of a migration record.
///
/// `Pending` is the only non-terminal status. A record leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Staged or claimed, not yet resolved.
    Pending,
    /// The destination entity exists and is linked.
    Success,
    /// The attempt failed; the error message says why.
    Failed,
    /// Superseded by another canonical record for the same key.
    Skipped,
}

impl RecordStatus {
    /// Every status, in display order.
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::Pending,
        RecordStatus::Success,
        RecordStatus::Failed,
        RecordStatus::Skipped,
    ];

    /// Returns true for success, failed and skipped.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true for the statuses that can make a record canonical.
    #[must_use]
    pub const fn is_canonical_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown record status: {s}"))
    }
}

/// Marks a pending record as taken by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMarker {
    /// The run holding the claim.
    pub run: RunId,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
}

impl ClaimMarker {
    /// Creates a claim for `run` taken at `now`.
    #[must_use]
    pub fn new(run: RunId, now: DateTime<Utc>) -> Self {
        Self {
            run,
            claimed_at: now,
        }
    }

    /// Returns true while the claim is younger than `lease`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        now.signed_duration_since(self.claimed_at) < lease
    }
}

/// The identity under which at most one canonical terminal record may exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Owning tenant.
    pub owner: OwnerId,
    /// Entity type.
    pub kind: EntityKind,
    /// System the entity comes from.
    pub source_system: SystemId,
    /// System the entity goes to.
    pub destination_system: SystemId,
    /// Entity ID in the source system.
    pub source_entity_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key:{}/{}/{}->{}/{}",
            self.owner, self.kind, self.source_system, self.destination_system, self.source_entity_id
        )
    }
}

/// A terminal transition applied to a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The destination entity was created or linked.
    Success {
        /// ID of the entity in the destination system.
        destination_entity_id: String,
        /// Optional informational message (e.g. "already existed; linked").
        message: Option<String>,
    },
    /// The attempt failed.
    Failed {
        /// Why it failed.
        message: String,
    },
    /// Another record is canonical for the same key.
    Skipped {
        /// The canonical record.
        canonical: RecordId,
        /// Why this record was skipped.
        message: String,
    },
}

impl Outcome {
    /// Creates a success outcome without a message.
    pub fn success(destination_entity_id: impl Into<String>) -> Self {
        Self::Success {
            destination_entity_id: destination_entity_id.into(),
            message: None,
        }
    }

    /// Creates a failed outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates a skipped outcome pointing at the canonical record.
    #[must_use]
    pub fn superseded_by(canonical: RecordId) -> Self {
        Self::Skipped {
            canonical,
            message: format!("superseded by canonical record {canonical}"),
        }
    }

    /// The status this outcome moves a record to.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        match self {
            Self::Success { .. } => RecordStatus::Success,
            Self::Failed { .. } => RecordStatus::Failed,
            Self::Skipped { .. } => RecordStatus::Skipped,
        }
    }
}

/// Fields of a record about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    /// Owning tenant.
    pub owner: OwnerId,
    /// Entity type.
    pub kind: EntityKind,
    /// Source system.
    pub source_system: SystemId,
    /// Destination system, unknown at export time.
    pub destination_system: Option<SystemId>,
    /// Source entity ID; `None` for a placeholder.
    pub source_entity_id: Option<String>,
    /// Human-readable name of the source entity.
    pub source_entity_name: Option<String>,
    /// Claim to stamp at insert time (just-in-time records).
    pub claim: Option<ClaimMarker>,
}

impl NewRecord {
    /// A pending export row for a known source entity.
    pub fn staged(
        owner: OwnerId,
        kind: EntityKind,
        source_system: SystemId,
        source_entity_id: impl Into<String>,
        source_entity_name: Option<String>,
    ) -> Self {
        Self {
            owner,
            kind,
            source_system,
            destination_system: None,
            source_entity_id: Some(source_entity_id.into()),
            source_entity_name,
            claim: None,
        }
    }

    /// A pending row not yet tied to any source entity.
    #[must_use]
    pub fn placeholder(owner: OwnerId, kind: EntityKind, source_system: SystemId) -> Self {
        Self {
            owner,
            kind,
            source_system,
            destination_system: None,
            source_entity_id: None,
            source_entity_name: None,
            claim: None,
        }
    }

    /// Sets the destination system.
    #[must_use]
    pub fn with_destination(mut self, destination: SystemId) -> Self {
        self.destination_system = Some(destination);
        self
    }

    /// Stamps a claim on the new row.
    #[must_use]
    pub fn with_claim(mut self, claim: ClaimMarker) -> Self {
        self.claim = Some(claim);
        self
    }
}

/// One migration attempt for one source entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Store-assigned identifier.
    pub id: RecordId,
    /// Owning tenant.
    pub owner: OwnerId,
    /// Entity type.
    pub kind: EntityKind,
    /// Source system.
    pub source_system: SystemId,
    /// Destination system; `None` until the record is claimed by a run.
    pub destination_system: Option<SystemId>,
    /// Source entity ID; `None` for a placeholder.
    pub source_entity_id: Option<String>,
    /// Human-readable source name (code, email, title).
    pub source_entity_name: Option<String>,
    /// Destination entity ID, set on success.
    pub destination_entity_id: Option<String>,
    /// Current status.
    pub status: RecordStatus,
    /// Error or informational message.
    pub error_message: Option<String>,
    /// Canonical record for skipped rows.
    pub canonical_id: Option<RecordId>,
    /// Claim held by a run, if any.
    pub claim: Option<ClaimMarker>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub(crate) fn from_new(id: RecordId, new: NewRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: new.owner,
            kind: new.kind,
            source_system: new.source_system,
            destination_system: new.destination_system,
            source_entity_id: new.source_entity_id,
            source_entity_name: new.source_entity_name,
            destination_entity_id: None,
            status: RecordStatus::Pending,
            error_message: None,
            canonical_id: None,
            claim: new.claim,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the record has left `Pending`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the record is pending and holds no live claim.
    ///
    /// A run never re-claims its own in-flight records, so a live claim
    /// excludes the record for every run, including the claimant.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status == RecordStatus::Pending
            && self.claim.map_or(true, |claim| !claim.is_live(now, lease))
    }

    /// Returns true if `run` holds a live claim on the record.
    #[must_use]
    pub fn is_claimed_by(&self, run: RunId, now: DateTime<Utc>, lease: Duration) -> bool {
        self.claim
            .is_some_and(|claim| claim.run == run && claim.is_live(now, lease))
    }

    /// The uniqueness key, once destination and source entity are known.
    #[must_use]
    pub fn key(&self) -> Option<RecordKey> {
        Some(RecordKey {
            owner: self.owner.clone(),
            kind: self.kind,
            source_system: self.source_system.clone(),
            destination_system: self.destination_system.clone()?,
            source_entity_id: self.source_entity_id.clone()?,
        })
    }

    /// Returns true if the record belongs to `key`.
    #[must_use]
    pub fn matches_key(&self, key: &RecordKey) -> bool {
        self.owner == key.owner
            && self.kind == key.kind
            && self.source_system == key.source_system
            && self.destination_system.as_ref() == Some(&key.destination_system)
            && self.source_entity_id.as_deref() == Some(key.source_entity_id.as_str())
    }

    /// Applies a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] if the record is not pending.
    pub fn apply(&mut self, outcome: Outcome, now: DateTime<Utc>) -> LedgerResult<()> {
        if self.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                record: self.id,
                from: self.status,
                to: outcome.status(),
            });
        }

        self.status = outcome.status();
        match outcome {
            Outcome::Success {
                destination_entity_id,
                message,
            } => {
                self.destination_entity_id = Some(destination_entity_id);
                self.error_message = message;
            }
            Outcome::Failed { message } => {
                self.error_message = Some(message);
            }
            Outcome::Skipped { canonical, message } => {
                self.canonical_id = Some(canonical);
                self.error_message = Some(message);
            }
        }
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }
}
