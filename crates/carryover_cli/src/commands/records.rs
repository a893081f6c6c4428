//! Records command implementation.

use super::{print_json, CommandResult, Context};
use carryover_ledger::{DestinationFilter, EntityKind, MigrationRecord, RecordQuery, RecordStatus, SystemId};

/// Filters for the records listing.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Entity kind.
    pub kind: Option<EntityKind>,
    /// Record status.
    pub status: Option<RecordStatus>,
    /// Source system.
    pub source: Option<String>,
    /// Destination system.
    pub destination: Option<String>,
    /// Maximum rows shown.
    pub limit: usize,
}

impl RecordFilter {
    fn query(&self, owner: carryover_ledger::OwnerId) -> RecordQuery {
        let mut query = RecordQuery::new().owner(owner).limit(self.limit);
        if let Some(kind) = self.kind {
            query = query.kind(kind);
        }
        if let Some(status) = self.status {
            query = query.status(status);
        }
        if let Some(source) = &self.source {
            query = query.source_system(SystemId::new(source.as_str()));
        }
        if let Some(destination) = &self.destination {
            query = query.destination(DestinationFilter::Is(SystemId::new(destination.as_str())));
        }
        query
    }
}

/// Lists records matching `filter`.
pub fn run(ctx: &Context, filter: &RecordFilter, format: &str) -> CommandResult {
    let ledger = ctx.existing_ledger()?;
    let owner = ctx.config.engine_config(ctx.owner.as_deref()).owner;
    let records = ledger.query(&filter.query(owner));

    match format {
        "json" => print_json(&records)?,
        _ => print_text(&records),
    }
    Ok(())
}

fn print_text(records: &[MigrationRecord]) {
    if records.is_empty() {
        println!("No matching records.");
        return;
    }
    for record in records {
        let dash = || "-".to_string();
        println!(
            "{:<10} {:<16} {:<8} {} -> {}  {} => {}",
            record.id.to_string(),
            record.kind.as_str(),
            record.status.as_str(),
            record.source_system,
            record
                .destination_system
                .as_ref()
                .map_or_else(dash, ToString::to_string),
            record
                .source_entity_name
                .clone()
                .or_else(|| record.source_entity_id.clone())
                .unwrap_or_else(dash),
            record.destination_entity_id.clone().unwrap_or_else(dash),
        );
        if let Some(message) = &record.error_message {
            println!("           {message}");
        }
        if let Some(canonical) = record.canonical_id {
            println!("           canonical: {canonical}");
        }
    }
}
