//! Status command implementation.

use super::{print_json, CommandResult, Context};
use carryover_ledger::{LedgerStats, RecoveryInfo, StatusCounts};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct StatusOutput<'a> {
    ledger: String,
    stats: LedgerStats,
    recovery: &'a RecoveryInfo,
}

/// Prints per-kind record counts.
pub fn run(ctx: &Context, format: &str) -> CommandResult {
    let ledger = ctx.existing_ledger()?;
    let output = StatusOutput {
        ledger: ctx.ledger_path.display().to_string(),
        stats: ledger.stats(),
        recovery: ledger.recovery(),
    };

    match format {
        "json" => print_json(&output)?,
        _ => print_text(&output),
    }
    Ok(())
}

fn print_text(output: &StatusOutput<'_>) {
    println!("Ledger {}", output.ledger);
    println!("  Records: {}", output.stats.records);
    if output.recovery.truncated_bytes > 0 {
        println!(
            "  Recovered: {} bytes of torn tail removed",
            output.recovery.truncated_bytes
        );
    }
    println!();
    println!(
        "  {:<16} {:>8} {:>8} {:>8} {:>8}",
        "kind", "pending", "success", "failed", "skipped"
    );
    for (kind, counts) in &output.stats.by_kind {
        print_row(kind.as_str(), counts);
    }
    print_row("total", &output.stats.totals);
}

fn print_row(label: &str, counts: &StatusCounts) {
    println!(
        "  {label:<16} {:>8} {:>8} {:>8} {:>8}",
        counts.pending, counts.success, counts.failed, counts.skipped
    );
}
