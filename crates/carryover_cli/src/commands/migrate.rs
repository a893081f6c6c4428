//! Migrate command implementation.

use super::{print_json, CommandResult, Context};
use carryover_engine::{KindSummary, MigrationSummary};
use carryover_ledger::{EntityKind, SystemId};
use tracing::info;

/// Options for one migrate invocation.
#[derive(Debug, Clone)]
pub struct MigrateArgs {
    /// Source system ID.
    pub source: String,
    /// Destination system ID.
    pub destination: String,
    /// Restrict the run to one kind.
    pub kind: Option<EntityKind>,
    /// Cap on items claimed.
    pub max: Option<usize>,
    /// Stage the source export before migrating.
    pub stage: bool,
    /// Output format (text, json).
    pub format: String,
}

/// Runs a migration and writes snapshot systems back afterwards.
pub fn run(ctx: &Context, args: &MigrateArgs) -> CommandResult {
    let (engine, registry) = ctx.engine()?;
    let source = SystemId::new(args.source.as_str());
    let destination = SystemId::new(args.destination.as_str());

    if args.stage {
        let report = engine.stage_export(&source)?;
        info!(staged = report.rows_staged(), "source staged");
    }

    let outcome = match args.kind {
        Some(kind) => engine
            .run_kind(&source, &destination, kind, args.max)
            .map(|summary| Outcome::Kind(kind, summary)),
        None => engine
            .run_migration(&source, &destination, args.max)
            .map(Outcome::Full),
    };
    // Destination writes happened even if the run stopped early.
    registry.save_snapshots()?;
    let outcome = outcome?;

    match (args.format.as_str(), &outcome) {
        ("json", Outcome::Full(summary)) => print_json(summary)?,
        ("json", Outcome::Kind(_, summary)) => print_json(summary)?,
        (_, Outcome::Full(summary)) => print_summary(summary),
        (_, Outcome::Kind(kind, summary)) => {
            println!("{} -> {} ({kind})", args.source, args.destination);
            print_kind_line(*kind, summary);
        }
    }
    Ok(())
}

enum Outcome {
    Full(MigrationSummary),
    Kind(EntityKind, KindSummary),
}

fn print_summary(summary: &MigrationSummary) {
    println!("Migration {} -> {}", summary.source, summary.destination);
    println!("  Run: {}", summary.run);
    println!();
    for (kind, kind_summary) in &summary.per_kind {
        print_kind_line(*kind, kind_summary);
    }
    println!();
    println!(
        "  Total: {} imported, {} failed, {} skipped",
        summary.imported, summary.failed, summary.skipped
    );
}

fn print_kind_line(kind: EntityKind, summary: &KindSummary) {
    if let Some(error) = &summary.error {
        println!("  {:<16} not processed: {error}", kind.as_str());
        return;
    }
    print!(
        "  {:<16} {:>5} imported ({} linked), {:>5} failed, {:>5} skipped",
        kind.as_str(),
        summary.imported,
        summary.linked,
        summary.failed,
        summary.skipped
    );
    if summary.corrective_writes > 0 {
        print!(", {} corrective writes", summary.corrective_writes);
    }
    println!();
}
