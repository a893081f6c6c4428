//! Destination-side deduplication by natural key.

use crate::collaborator::{Lookup, RemoteSystem};
use crate::config::EngineConfig;
use crate::entity::{entity_id, EntityProfile};
use crate::error::EngineError;
use crate::staging::fetch_all;
use carryover_ledger::EntityKind;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How the index answers lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeMode {
    /// The whole destination collection was listed up front.
    Indexed,
    /// Listing failed or stopped early; candidates missing from the
    /// partial index are looked up by key.
    Lookup,
    /// Neither listing nor lookup works; nothing is deduplicated.
    Disabled,
}

/// Normalized natural key → destination ID for one kind in one destination.
pub struct DestinationIndex<'a> {
    destination: &'a dyn RemoteSystem,
    kind: EntityKind,
    mode: DedupeMode,
    keys: HashMap<String, String>,
}

impl std::fmt::Debug for DestinationIndex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationIndex")
            .field("destination", self.destination.id())
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl<'a> DestinationIndex<'a> {
    /// Lists the destination collection and indexes it.
    ///
    /// If listing fails or stops early the index switches to per-candidate
    /// lookups for keys it does not hold.
    pub fn build(destination: &'a dyn RemoteSystem, kind: EntityKind, config: &EngineConfig) -> Self {
        let profile = EntityProfile::for_kind(kind);
        let mut index = Self {
            destination,
            kind,
            mode: DedupeMode::Indexed,
            keys: HashMap::new(),
        };

        match fetch_all(destination, kind, config) {
            Ok(listing) => {
                for item in &listing.items {
                    if let (Some(key), Some(id)) = (profile.normalized_key(item), entity_id(item)) {
                        index.keys.entry(key).or_insert(id);
                    }
                }
                if listing.complete {
                    debug!(
                        system = %destination.id(),
                        kind = %kind,
                        keys = index.keys.len(),
                        "indexed destination"
                    );
                } else {
                    warn!(
                        system = %destination.id(),
                        kind = %kind,
                        keys = index.keys.len(),
                        "destination listing incomplete, key lookups cover the rest"
                    );
                    index.mode = DedupeMode::Lookup;
                }
            }
            Err(err) => {
                warn!(
                    system = %destination.id(),
                    kind = %kind,
                    error = %err,
                    "cannot list destination, falling back to key lookups"
                );
                index.mode = DedupeMode::Lookup;
            }
        }
        index
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> DedupeMode {
        self.mode
    }

    /// Number of keys known locally.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is known locally.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The destination ID already holding `key`, if any.
    ///
    /// `key` must be normalized. In lookup mode a failed lookup counts as a
    /// miss; an unsupported lookup disables deduplication for the rest of
    /// the run.
    pub fn find(&mut self, key: &str) -> Option<String> {
        if let Some(id) = self.keys.get(key) {
            return Some(id.clone());
        }
        if self.mode != DedupeMode::Lookup {
            return None;
        }

        match self.destination.find_by_natural_key(self.kind, key) {
            Ok(Lookup::Found(entity)) => {
                let id = entity_id(&entity)?;
                self.keys.insert(key.to_string(), id.clone());
                Some(id)
            }
            Ok(Lookup::NotFound) => None,
            Err(EngineError::Unsupported(reason)) => {
                warn!(
                    system = %self.destination.id(),
                    kind = %self.kind,
                    reason = %reason,
                    "natural-key lookup unsupported, deduplication disabled"
                );
                self.mode = DedupeMode::Disabled;
                None
            }
            Err(err) => {
                warn!(kind = %self.kind, key, error = %err, "natural-key lookup failed");
                None
            }
        }
    }

    /// Records an entity created during the run.
    pub fn insert(&mut self, key: impl Into<String>, destination_id: impl Into<String>) {
        self.keys.insert(key.into(), destination_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::Page;
    use crate::error::EngineResult;
    use carryover_ledger::SystemId;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct Destination {
        id: SystemId,
        items: Vec<Value>,
        listable: bool,
        lookup: Option<Vec<Value>>,
        lookups: Mutex<usize>,
    }

    impl Destination {
        fn new(items: Vec<Value>) -> Self {
            Self {
                id: SystemId::new("shop"),
                items,
                listable: true,
                lookup: None,
                lookups: Mutex::new(0),
            }
        }
    }

    impl RemoteSystem for Destination {
        fn id(&self) -> &SystemId {
            &self.id
        }

        fn list(&self, _kind: EntityKind, _cursor: Option<&str>, _limit: usize) -> EngineResult<Page> {
            if self.listable {
                Ok(Page::last(self.items.clone()))
            } else {
                Err(EngineError::transport("503 service unavailable", None, true))
            }
        }

        fn create(&self, _kind: EntityKind, _payload: &Value) -> EngineResult<Value> {
            Ok(json!({}))
        }

        fn find_by_natural_key(&self, kind: EntityKind, key: &str) -> EngineResult<Lookup> {
            let Some(entities) = &self.lookup else {
                return Err(EngineError::Unsupported("no lookup".into()));
            };
            *self.lookups.lock() += 1;
            let profile = EntityProfile::for_kind(kind);
            Ok(entities
                .iter()
                .find(|e| profile.normalized_key(e).as_deref() == Some(key))
                .cloned()
                .map_or(Lookup::NotFound, Lookup::Found))
        }
    }

    #[test]
    fn index_matches_normalized_keys() {
        let dest = Destination::new(vec![
            json!({"id": "d-1", "code": " SAVE10 "}),
            json!({"id": "d-2", "code": "WELCOME"}),
            json!({"code": "NOID"}),
        ]);
        let mut index = DestinationIndex::build(&dest, EntityKind::Coupon, &EngineConfig::default());

        assert_eq!(index.mode(), DedupeMode::Indexed);
        assert_eq!(index.len(), 2);
        assert_eq!(index.find("save10"), Some("d-1".into()));
        assert_eq!(index.find("noid"), None);

        index.insert("fresh", "d-9");
        assert_eq!(index.find("fresh"), Some("d-9".into()));
    }

    #[test]
    fn listing_failure_falls_back_to_lookup() {
        let mut dest = Destination::new(Vec::new());
        dest.listable = false;
        dest.lookup = Some(vec![json!({"id": "d-1", "email": "Ann@Example.com"})]);
        let mut index =
            DestinationIndex::build(&dest, EntityKind::LoyaltyAccount, &EngineConfig::default());

        assert_eq!(index.mode(), DedupeMode::Lookup);
        assert_eq!(index.find("ann@example.com"), Some("d-1".into()));
        assert_eq!(index.find("ann@example.com"), Some("d-1".into()));
        assert_eq!(*dest.lookups.lock(), 1);
        assert_eq!(index.find("bob@example.com"), None);
    }

    #[test]
    fn unsupported_lookup_disables_deduplication() {
        let mut dest = Destination::new(Vec::new());
        dest.listable = false;
        let mut index = DestinationIndex::build(&dest, EntityKind::Coupon, &EngineConfig::default());

        assert_eq!(index.find("save10"), None);
        assert_eq!(index.mode(), DedupeMode::Disabled);
        index.insert("save10", "d-1");
        assert_eq!(index.find("save10"), Some("d-1".into()));
    }
}
