//! Bulk submission and positional result interpretation.

use crate::collaborator::RemoteSystem;
use crate::entity::{lookup_path, scalar_text};
use carryover_ledger::EntityKind;
use serde_json::Value;
use tracing::{debug, warn};

const SUCCESS_FLAGS: [&str; 3] = ["success", "ok", "created"];
const SUCCESS_STATUSES: [&str; 3] = ["success", "created", "ok"];
const ID_PATHS: [&str; 5] = ["id", "entity_id", "data.id", "entity.id", "result.id"];

/// What the destination reported for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    /// Created with this destination ID.
    Created(String),
    /// Not created, with the reported reason.
    Failed(String),
}

/// Submits `payloads` in chunks of `chunk_size`, one bulk call per chunk.
///
/// Returns one result per payload, in payload order. A chunk whose call
/// fails as a whole fails every payload in it with the error, raw response
/// included.
pub fn submit(
    system: &dyn RemoteSystem,
    kind: EntityKind,
    payloads: &[Value],
    chunk_size: usize,
) -> Vec<ItemResult> {
    let mut results = Vec::with_capacity(payloads.len());
    for chunk in payloads.chunks(chunk_size.max(1)) {
        match system.bulk_create(kind, chunk) {
            Ok(raw) => {
                debug!(kind = %kind, size = chunk.len(), returned = raw.len(), "bulk create");
                results.extend(interpret_results(&raw, chunk.len()));
            }
            Err(err) => {
                warn!(kind = %kind, size = chunk.len(), error = %err, "bulk create failed");
                let message = err.record_message();
                results.extend(std::iter::repeat(ItemResult::Failed(message)).take(chunk.len()));
            }
        }
    }
    results
}

/// Aligns a result array with a chunk of `expected` payloads.
#[must_use]
pub fn interpret_results(results: &[Value], expected: usize) -> Vec<ItemResult> {
    (0..expected)
        .map(|position| match results.get(position) {
            Some(result) => interpret(result),
            None => ItemResult::Failed(format!("no result returned for position {position}")),
        })
        .collect()
}

/// Interprets one result object.
///
/// An explicit success flag must be true and an ID present; without a flag
/// an ID and no error is enough.
#[must_use]
pub fn interpret(result: &Value) -> ItemResult {
    if let Value::String(id) = result {
        return match id.trim() {
            "" => ItemResult::Failed("empty result".into()),
            id => ItemResult::Created(id.to_string()),
        };
    }

    let id = ID_PATHS
        .iter()
        .filter_map(|path| lookup_path(result, path))
        .find_map(scalar_text)
        .filter(|id| !id.trim().is_empty());
    let error = error_message(result);

    let succeeded = match success_flag(result) {
        Some(flag) => flag,
        None => error.is_none(),
    };
    match (succeeded, id) {
        (true, Some(id)) => ItemResult::Created(id),
        (true, None) => ItemResult::Failed(
            error.unwrap_or_else(|| "destination reported success without an id".into()),
        ),
        (false, _) => ItemResult::Failed(
            error.unwrap_or_else(|| "destination reported failure without a message".into()),
        ),
    }
}

fn success_flag(result: &Value) -> Option<bool> {
    for field in SUCCESS_FLAGS {
        if let Some(flag) = result.get(field).and_then(Value::as_bool) {
            return Some(flag);
        }
    }
    result
        .get("status")
        .and_then(Value::as_str)
        .map(|status| SUCCESS_STATUSES.contains(&status.trim().to_ascii_lowercase().as_str()))
}

fn error_message(result: &Value) -> Option<String> {
    let text = |value: &Value| match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(_) => value.get("message").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    result
        .get("error")
        .and_then(text)
        .or_else(|| result.get("error_message").and_then(text))
        .or_else(|| result.get("message").and_then(text))
        .or_else(|| {
            result
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .and_then(text)
        })
}
