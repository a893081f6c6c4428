//! Record filters.

use crate::record::{EntityKind, MigrationRecord, OwnerId, RecordKey, RecordStatus, SystemId};
use chrono::{DateTime, Duration, Utc};

/// Filter on a record's destination system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DestinationFilter {
    /// Any destination, set or not.
    #[default]
    Any,
    /// Only records with no destination yet.
    Unset,
    /// Only records for this destination.
    Is(SystemId),
    /// Records for this destination or with none yet.
    UnsetOr(SystemId),
}

/// Filter on a record's source entity ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EntityFilter {
    /// Any source entity, including placeholders.
    #[default]
    Any,
    /// Only placeholders.
    Unset,
    /// Only this source entity.
    Is(String),
}

#[derive(Debug, Clone, Copy)]
struct ClaimFilter {
    now: DateTime<Utc>,
    lease: Duration,
}

/// A conjunction of record filters, evaluated in record-ID order.
///
/// ```
/// use carryover_ledger::{EntityKind, RecordQuery, RecordStatus};
///
/// let query = RecordQuery::new()
///     .kind(EntityKind::Coupon)
///     .status(RecordStatus::Pending)
///     .limit(10);
/// # let _ = query;
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    owner: Option<OwnerId>,
    kind: Option<EntityKind>,
    source_system: Option<SystemId>,
    destination: DestinationFilter,
    source_entity: EntityFilter,
    destination_entity_id: Option<String>,
    statuses: Vec<RecordStatus>,
    exclude_statuses: Vec<RecordStatus>,
    claimable: Option<ClaimFilter>,
    limit: Option<usize>,
}

impl RecordQuery {
    /// A query matching every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, of any status, under `key`.
    #[must_use]
    pub fn for_key(key: &RecordKey) -> Self {
        Self::new()
            .owner(key.owner.clone())
            .kind(key.kind)
            .source_system(key.source_system.clone())
            .destination(DestinationFilter::Is(key.destination_system.clone()))
            .source_entity(EntityFilter::Is(key.source_entity_id.clone()))
    }

    /// Restricts to one owner.
    #[must_use]
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Restricts to one entity kind.
    #[must_use]
    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restricts to one source system.
    #[must_use]
    pub fn source_system(mut self, system: SystemId) -> Self {
        self.source_system = Some(system);
        self
    }

    /// Filters on the destination system.
    #[must_use]
    pub fn destination(mut self, filter: DestinationFilter) -> Self {
        self.destination = filter;
        self
    }

    /// Filters on the source entity ID.
    #[must_use]
    pub fn source_entity(mut self, filter: EntityFilter) -> Self {
        self.source_entity = filter;
        self
    }

    /// Restricts to records linked to this destination entity.
    #[must_use]
    pub fn destination_entity_id(mut self, id: impl Into<String>) -> Self {
        self.destination_entity_id = Some(id.into());
        self
    }

    /// Adds an accepted status. Without any, all statuses match.
    #[must_use]
    pub fn status(mut self, status: RecordStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Excludes a status.
    #[must_use]
    pub fn exclude_status(mut self, status: RecordStatus) -> Self {
        self.exclude_statuses.push(status);
        self
    }

    /// Only pending records without a live claim: never claimed, or
    /// claimed longer than `lease` ago.
    #[must_use]
    pub fn claimable(mut self, now: DateTime<Utc>, lease: Duration) -> Self {
        self.claimable = Some(ClaimFilter { now, lease });
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The result cap, if any.
    #[must_use]
    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn partition(&self) -> Option<(&OwnerId, EntityKind, &SystemId)> {
        Some((self.owner.as_ref()?, self.kind?, self.source_system.as_ref()?))
    }

    /// Returns true if `record` passes every filter.
    #[must_use]
    pub fn matches(&self, record: &MigrationRecord) -> bool {
        if self.owner.as_ref().is_some_and(|o| *o != record.owner) {
            return false;
        }
        if self.kind.is_some_and(|k| k != record.kind) {
            return false;
        }
        if self
            .source_system
            .as_ref()
            .is_some_and(|s| *s != record.source_system)
        {
            return false;
        }

        let destination_ok = match &self.destination {
            DestinationFilter::Any => true,
            DestinationFilter::Unset => record.destination_system.is_none(),
            DestinationFilter::Is(system) => record.destination_system.as_ref() == Some(system),
            DestinationFilter::UnsetOr(system) => record
                .destination_system
                .as_ref()
                .map_or(true, |d| d == system),
        };
        if !destination_ok {
            return false;
        }

        let entity_ok = match &self.source_entity {
            EntityFilter::Any => true,
            EntityFilter::Unset => record.source_entity_id.is_none(),
            EntityFilter::Is(id) => record.source_entity_id.as_deref() == Some(id.as_str()),
        };
        if !entity_ok {
            return false;
        }

        if let Some(id) = &self.destination_entity_id {
            if record.destination_entity_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.exclude_statuses.contains(&record.status) {
            return false;
        }
        if let Some(claim) = self.claimable {
            if !record.is_claimable(claim.now, claim.lease) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NewRecord, RecordId, RunId};

    fn record(destination: Option<&str>, entity: Option<&str>) -> MigrationRecord {
        let mut new = NewRecord::placeholder(
            OwnerId::new("acme"),
            EntityKind::Coupon,
            SystemId::new("legacy"),
        );
        new.destination_system = destination.map(SystemId::new);
        new.source_entity_id = entity.map(str::to_string);
        MigrationRecord::from_new(RecordId::new(1), new, Utc::now())
    }

    #[test]
    fn destination_unset_or_matches_both() {
        let query = RecordQuery::new().destination(DestinationFilter::UnsetOr(SystemId::new("shop")));
        assert!(query.matches(&record(None, Some("c-1"))));
        assert!(query.matches(&record(Some("shop"), Some("c-1"))));
        assert!(!query.matches(&record(Some("other"), Some("c-1"))));
    }

    #[test]
    fn placeholder_filter() {
        let query = RecordQuery::new().source_entity(EntityFilter::Unset);
        assert!(query.matches(&record(None, None)));
        assert!(!query.matches(&record(None, Some("c-1"))));
    }

    #[test]
    fn status_include_and_exclude() {
        let pending = record(None, Some("c-1"));
        assert!(RecordQuery::new().status(RecordStatus::Pending).matches(&pending));
        assert!(!RecordQuery::new().status(RecordStatus::Success).matches(&pending));
        assert!(!RecordQuery::new()
            .exclude_status(RecordStatus::Pending)
            .matches(&pending));
    }

    #[test]
    fn claimable_excludes_live_claims() {
        let now = Utc::now();
        let mut claimed = record(None, Some("c-1"));
        claimed.claim = Some(crate::record::ClaimMarker::new(RunId::new(), now));

        let lease = Duration::minutes(15);
        assert!(!RecordQuery::new().claimable(now, lease).matches(&claimed));
        assert!(RecordQuery::new()
            .claimable(now, Duration::zero())
            .matches(&claimed));
    }
}
