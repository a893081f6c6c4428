//! Staging: paging through a source collection and inserting pending rows.

use crate::collaborator::RemoteSystem;
use crate::config::EngineConfig;
use crate::entity::{entity_id, lookup_path, EntityProfile};
use crate::error::EngineResult;
use carryover_ledger::{EntityKind, Ledger, NewRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Paths tried, in order, for an entity's creation time.
pub const CREATED_AT_PATHS: [&str; 9] = [
    "created_at",
    "createdAt",
    "date_created",
    "created",
    "inserted_at",
    "audit.created_at",
    "audit.createdAt",
    "meta.created_at",
    "metadata.created_at",
];

/// Epoch values below this are read as seconds rather than milliseconds.
const SECONDS_CUTOFF: f64 = 1e11;

/// Rows staged by one export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Pending rows inserted per kind.
    pub staged: BTreeMap<EntityKind, usize>,
    /// Source entities without an ID or natural key, per kind.
    pub rejected: BTreeMap<EntityKind, usize>,
}

impl StageReport {
    /// Total rows staged.
    #[must_use]
    pub fn rows_staged(&self) -> usize {
        self.staged.values().sum()
    }

    /// Total entities rejected.
    #[must_use]
    pub fn rows_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Everything one paging pass returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Entities in the order the system returned them.
    pub items: Vec<Value>,
    /// False when paging stopped at the ceiling or on a repeated cursor,
    /// leaving entities unread.
    pub complete: bool,
}

/// Reads a whole collection, following cursors.
///
/// Stops at the page ceiling or when a cursor repeats, logging a warning
/// and returning a listing marked incomplete.
pub fn fetch_all(
    system: &dyn RemoteSystem,
    kind: EntityKind,
    config: &EngineConfig,
) -> EngineResult<Listing> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();
    let mut pages = 0usize;

    let complete = loop {
        if pages >= config.page_ceiling {
            warn!(
                system = %system.id(),
                kind = %kind,
                pages,
                "page ceiling reached, stopping pagination"
            );
            break false;
        }
        let page = system.list(kind, cursor.as_deref(), config.page_size)?;
        pages += 1;
        items.extend(page.items);

        match page.next_cursor.filter(|c| !c.is_empty()) {
            None => break true,
            Some(next) if !seen.insert(next.clone()) => {
                warn!(
                    system = %system.id(),
                    kind = %kind,
                    cursor = %next,
                    "cursor repeated, stopping pagination"
                );
                break false;
            }
            Some(next) => cursor = Some(next),
        }
    };
    Ok(Listing { items, complete })
}

/// Reads an entity's creation time from the first path that parses.
#[must_use]
pub fn created_at(item: &Value) -> Option<DateTime<Utc>> {
    CREATED_AT_PATHS
        .iter()
        .filter_map(|path| lookup_path(item, path))
        .find_map(parse_timestamp)
}

/// Parses epoch numbers and the common date string shapes.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() < SECONDS_CUTOFF {
        raw * 1000.0
    } else {
        raw
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(raw) = s.parse::<f64>() {
        return from_epoch(raw);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Sorts entities oldest first. Undated entities go last; ties keep their
/// source order.
pub fn sort_oldest_first(items: &mut Vec<Value>) {
    let mut keyed: Vec<(Option<DateTime<Utc>>, Value)> = items
        .drain(..)
        .map(|item| (created_at(&item), item))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    items.extend(keyed.into_iter().map(|(_, item)| item));
}

/// Stages one kind from `source`. Returns (staged, rejected).
pub(crate) fn stage_kind(
    ledger: &Ledger,
    source: &dyn RemoteSystem,
    kind: EntityKind,
    config: &EngineConfig,
) -> EngineResult<(usize, usize)> {
    let profile = EntityProfile::for_kind(kind);
    let mut items = fetch_all(source, kind, config)?.items;
    sort_oldest_first(&mut items);

    let mut staged = 0;
    let mut rejected = 0;
    for item in &items {
        let (Some(id), Some(key)) = (entity_id(item), profile.natural_key(item)) else {
            debug!(kind = %kind, "source entity without id or natural key, not staged");
            rejected += 1;
            continue;
        };
        ledger.insert_pending(NewRecord::staged(
            config.owner.clone(),
            kind,
            source.id().clone(),
            id,
            Some(key),
        ))?;
        staged += 1;
    }

    info!(
        system = %source.id(),
        kind = %kind,
        staged,
        rejected,
        "staged export"
    );
    Ok((staged, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::Page;
    use crate::error::EngineError;
    use carryover_ledger::{RecordQuery, RecordStatus, SystemId};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Serves fixed pages keyed by cursor.
    struct Paged {
        id: SystemId,
        pages: Vec<(Option<&'static str>, Page)>,
        calls: Mutex<usize>,
    }

    impl RemoteSystem for Paged {
        fn id(&self) -> &SystemId {
            &self.id
        }

        fn list(&self, _kind: EntityKind, cursor: Option<&str>, _limit: usize) -> EngineResult<Page> {
            *self.calls.lock() += 1;
            self.pages
                .iter()
                .find(|(c, _)| *c == cursor)
                .map(|(_, page)| page.clone())
                .ok_or_else(|| EngineError::Collaborator("bad cursor".into()))
        }

        fn create(&self, _kind: EntityKind, _payload: &Value) -> EngineResult<Value> {
            Err(EngineError::Unsupported("read only".into()))
        }
    }

    fn page(items: Vec<Value>, next: Option<&str>) -> Page {
        Page {
            items,
            next_cursor: next.map(str::to_string),
        }
    }

    #[test]
    fn timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!(1_709_294_400_000_i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_709_294_400)), Some(expected));
        assert_eq!(parse_timestamp(&json!("1709294400000")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-01T12:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-01T14:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-01 12:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-01 12:00:00.250")).map(|t| t.timestamp_millis()), Some(1_709_294_400_250));
        assert_eq!(
            parse_timestamp(&json!("2024-03-01")),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn nested_audit_paths() {
        let item = json!({"audit": {"createdAt": "2024-01-02"}});
        assert_eq!(
            created_at(&item),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        let unreadable_first = json!({"created_at": "soon", "metadata": {"created_at": 0}});
        assert_eq!(created_at(&unreadable_first), Utc.timestamp_millis_opt(0).single());
    }

    #[test]
    fn sort_is_oldest_first_and_stable() {
        let mut items = vec![
            json!({"id": "undated-1"}),
            json!({"id": "new", "created_at": "2024-05-01"}),
            json!({"id": "old", "createdAt": 1_600_000_000}),
            json!({"id": "undated-2"}),
            json!({"id": "mid", "meta": {"created_at": "2022-01-01 00:00:00"}}),
        ];
        sort_oldest_first(&mut items);
        let ids: Vec<_> = items.iter().map(|i| i["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["old", "mid", "new", "undated-1", "undated-2"]);
    }

    #[test]
    fn pagination_follows_cursors() {
        let system = Paged {
            id: SystemId::new("legacy"),
            pages: vec![
                (None, page(vec![json!({"id": 1})], Some("p2"))),
                (Some("p2"), page(vec![json!({"id": 2})], Some("p3"))),
                (Some("p3"), page(vec![json!({"id": 3})], None)),
            ],
            calls: Mutex::new(0),
        };
        let listing = fetch_all(&system, EntityKind::Brand, &EngineConfig::default()).unwrap();
        assert_eq!(listing.items.len(), 3);
        assert!(listing.complete);
        assert_eq!(*system.calls.lock(), 3);
    }

    #[test]
    fn pagination_stops_on_repeated_cursor_and_ceiling() {
        let looping = Paged {
            id: SystemId::new("legacy"),
            pages: vec![
                (None, page(vec![json!({"id": 1})], Some("again"))),
                (Some("again"), page(vec![json!({"id": 2})], Some("again"))),
            ],
            calls: Mutex::new(0),
        };
        let listing = fetch_all(&looping, EntityKind::Brand, &EngineConfig::default()).unwrap();
        assert_eq!(listing.items.len(), 2);
        assert!(!listing.complete);
        assert_eq!(*looping.calls.lock(), 2);

        let capped = EngineConfig::default().with_page_ceiling(1);
        *looping.calls.lock() = 0;
        let listing = fetch_all(&looping, EntityKind::Brand, &capped).unwrap();
        assert_eq!(listing.items.len(), 1);
        assert!(!listing.complete);
        assert_eq!(*looping.calls.lock(), 1);
    }

    #[test]
    fn staging_inserts_pending_rows_in_source_order() {
        let system = Paged {
            id: SystemId::new("legacy"),
            pages: vec![(
                None,
                page(
                    vec![
                        json!({"id": "c-2", "code": "LATER", "created_at": "2024-02-01"}),
                        json!({"id": "c-1", "code": "FIRST", "created_at": "2024-01-01"}),
                        json!({"id": "c-3", "code": "  "}),
                        json!({"code": "NOID"}),
                    ],
                    None,
                ),
            )],
            calls: Mutex::new(0),
        };
        let ledger = Ledger::in_memory();
        let config = EngineConfig::new("acme");

        let (staged, rejected) = stage_kind(&ledger, &system, EntityKind::Coupon, &config).unwrap();
        assert_eq!((staged, rejected), (2, 2));

        let rows = ledger.query(&RecordQuery::new().status(RecordStatus::Pending));
        let ids: Vec<_> = rows.iter().map(|r| r.source_entity_id.clone().unwrap()).collect();
        assert_eq!(ids, ["c-1", "c-2"]);
        assert_eq!(rows[0].source_entity_name.as_deref(), Some("FIRST"));
        assert!(rows.iter().all(|r| r.destination_system.is_none()));

        // A repeated export appends rather than failing.
        stage_kind(&ledger, &system, EntityKind::Coupon, &config).unwrap();
        assert_eq!(ledger.len(), 4);
    }
}
