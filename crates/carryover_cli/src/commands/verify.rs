//! Verify command implementation.

use super::{print_json, CommandResult, Context};
use carryover_ledger::{VerifyReport, Violation};

/// Checks the ledger invariants. Fails if any is broken.
pub fn run(ctx: &Context, format: &str) -> CommandResult {
    let ledger = ctx.existing_ledger()?;
    let report = ledger.verify();

    match format {
        "json" => print_json(&report)?,
        _ => print_text(&report),
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(format!("{} invariant violation(s)", report.violations.len()).into())
    }
}

fn print_text(report: &VerifyReport) {
    println!("Checked {} records", report.records);
    for violation in &report.violations {
        println!("  ✗ {}", describe(violation));
    }
    if report.is_ok() {
        println!("✓ Ledger verification passed");
    } else {
        println!("✗ Ledger verification failed");
    }
}

fn describe(violation: &Violation) -> String {
    match violation {
        Violation::DuplicateCanonical { key, records } => {
            let ids: Vec<String> = records.iter().map(ToString::to_string).collect();
            format!("{key} has several canonical records: {}", ids.join(", "))
        }
        Violation::MissingCanonical { record } => format!("{record} is skipped without a canonical record"),
        Violation::DanglingCanonical { record, canonical } => {
            format!("{record} points at missing canonical {canonical}")
        }
        Violation::MissingDestination { record } => {
            format!("{record} succeeded without a destination entity")
        }
    }
}
