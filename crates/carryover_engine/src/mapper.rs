//! Cross-reference mapping from source IDs to destination IDs.

use crate::config::MappingMode;
use crate::entity::{scalar_text, EntityProfile, RefRole, ReferenceField};
use crate::error::{EngineError, EngineResult};
use carryover_ledger::{
    DestinationFilter, EntityKind, Ledger, OwnerId, RecordQuery, RecordStatus, SystemId,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Source → destination IDs for one referenced kind, plus every destination
/// ID of that kind the ledger knows about.
#[derive(Debug, Default)]
struct ReferenceIndex {
    forward: HashMap<String, String>,
    destinations: HashSet<String>,
    /// Ledger success generation the index was built at.
    generation: u64,
}

/// Translates embedded references between system namespaces.
///
/// Indexes are derived from `success` records and built on first use. A
/// miss rebuilds the index only when records of that kind have succeeded
/// since it was built, in this run or a concurrent one.
#[derive(Debug)]
pub struct CrossReferenceMapper<'a> {
    ledger: &'a Ledger,
    owner: OwnerId,
    source: SystemId,
    destination: SystemId,
    indexes: HashMap<EntityKind, ReferenceIndex>,
    builds: usize,
}

impl<'a> CrossReferenceMapper<'a> {
    /// Creates a mapper between two systems.
    pub fn new(ledger: &'a Ledger, owner: OwnerId, source: SystemId, destination: SystemId) -> Self {
        Self {
            ledger,
            owner,
            source,
            destination,
            indexes: HashMap::new(),
            builds: 0,
        }
    }

    fn build(&self, kind: EntityKind) -> ReferenceIndex {
        let mut index = ReferenceIndex {
            generation: self.ledger.success_generation(kind),
            ..ReferenceIndex::default()
        };

        let mapped = RecordQuery::new()
            .owner(self.owner.clone())
            .kind(kind)
            .source_system(self.source.clone())
            .destination(DestinationFilter::Is(self.destination.clone()))
            .status(RecordStatus::Success);
        for record in self.ledger.query(&mapped) {
            if let (Some(source_id), Some(dest_id)) =
                (record.source_entity_id, record.destination_entity_id)
            {
                index.forward.insert(source_id, dest_id);
            }
        }

        let known = RecordQuery::new()
            .owner(self.owner.clone())
            .kind(kind)
            .destination(DestinationFilter::Is(self.destination.clone()))
            .status(RecordStatus::Success);
        index.destinations.extend(
            self.ledger
                .query(&known)
                .into_iter()
                .filter_map(|record| record.destination_entity_id),
        );
        index
    }

    fn lookup(&mut self, kind: EntityKind, source_ref: &str) -> Option<String> {
        let index = self.indexes.entry(kind).or_default();
        if let Some(found) = index.forward.get(source_ref) {
            return Some(found.clone());
        }
        if index.destinations.contains(source_ref) {
            return Some(source_ref.to_string());
        }
        None
    }

    /// Maps one reference.
    ///
    /// Returns the destination ID of a completed record for `source_ref`,
    /// or `source_ref` itself when it already is a known destination ID.
    pub fn map_reference(&mut self, kind: EntityKind, source_ref: &str) -> Option<String> {
        if let Some(built_at) = self.indexes.get(&kind).map(|index| index.generation) {
            if let Some(found) = self.lookup(kind, source_ref) {
                return Some(found);
            }
            if built_at == self.ledger.success_generation(kind) {
                return None;
            }
            debug!(kind = %kind, "new successes since index build, rebuilding");
        }
        let index = self.build(kind);
        self.builds += 1;
        self.indexes.insert(kind, index);
        self.lookup(kind, source_ref)
    }

    /// Index builds so far, across kinds.
    #[must_use]
    pub fn index_builds(&self) -> usize {
        self.builds
    }

    /// Rewrites every reference field of a payload.
    ///
    /// Scope references are stripped from entities that declare no scope.
    /// An unmapped reference rejects the entity when it is required or the
    /// mode is strict; in lenient mode an unmapped scope reference is
    /// dropped (array elements one by one, the field once nothing is left).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Mapping`] for the first rejected reference.
    pub fn map_payload(
        &mut self,
        profile: &EntityProfile,
        mut payload: Value,
        mode: MappingMode,
    ) -> EngineResult<Value> {
        let unscoped = profile.is_unscoped(&payload);
        let Some(object) = payload.as_object_mut() else {
            return Ok(payload);
        };

        for reference in profile.references {
            let Some(value) = object.get(reference.field).cloned() else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if unscoped && reference.role == RefRole::Scope {
                object.remove(reference.field);
                continue;
            }

            match value {
                Value::Array(elements) => {
                    let mut mapped = Vec::with_capacity(elements.len());
                    for element in &elements {
                        match self.map_element(reference, element, mode)? {
                            Some(id) => mapped.push(Value::String(id)),
                            None => continue,
                        }
                    }
                    if mapped.is_empty() && !elements.is_empty() {
                        object.remove(reference.field);
                    } else {
                        object.insert(reference.field.to_string(), Value::Array(mapped));
                    }
                }
                scalar => match self.map_element(reference, &scalar, mode)? {
                    Some(id) => {
                        object.insert(reference.field.to_string(), Value::String(id));
                    }
                    None => {
                        object.remove(reference.field);
                    }
                },
            }
        }
        Ok(payload)
    }

    /// `Ok(None)` means "drop this reference".
    fn map_element(
        &mut self,
        reference: &ReferenceField,
        element: &Value,
        mode: MappingMode,
    ) -> EngineResult<Option<String>> {
        let source_ref = scalar_text(element).unwrap_or_else(|| element.to_string());
        if let Some(mapped) = self.map_reference(reference.target, &source_ref) {
            return Ok(Some(mapped));
        }

        let rejects = reference.role == RefRole::Required || mode == MappingMode::Strict;
        if rejects {
            return Err(EngineError::Mapping {
                field: reference.field.to_string(),
                target: reference.target,
                source_id: source_ref,
            });
        }
        debug!(
            field = reference.field,
            reference = %source_ref,
            "dropping unmapped scope reference"
        );
        Ok(None)
    }
}
