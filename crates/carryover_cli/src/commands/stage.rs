//! Stage command implementation.

use super::{print_json, CommandResult, Context};
use carryover_engine::StageReport;
use carryover_ledger::SystemId;

/// Stages `system`'s export into the ledger.
pub fn run(ctx: &Context, system: &str, format: &str) -> CommandResult {
    let (engine, _registry) = ctx.engine()?;
    let report = engine.stage_export(&SystemId::new(system))?;

    match format {
        "json" => print_json(&report)?,
        _ => print_text(system, &report),
    }
    Ok(())
}

fn print_text(system: &str, report: &StageReport) {
    println!("Staged export of {system}");
    println!("=================={}", "=".repeat(system.len()));
    for (kind, staged) in &report.staged {
        let rejected = report.rejected.get(kind).copied().unwrap_or(0);
        if *staged == 0 && rejected == 0 {
            continue;
        }
        print!("  {:<16} {staged:>6} staged", kind.as_str());
        if rejected > 0 {
            print!(", {rejected} rejected");
        }
        println!();
    }
    println!();
    println!(
        "  Total: {} staged, {} rejected",
        report.rows_staged(),
        report.rows_rejected()
    );
}
