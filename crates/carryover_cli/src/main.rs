//! Carryover CLI
//!
//! Command-line front end for idempotent migrations between systems.
//!
//! # Commands
//!
//! - `stage` - Stage a system's export as pending records
//! - `migrate` - Migrate staged records to a destination
//! - `status` - Display per-kind record counts
//! - `records` - List ledger records
//! - `verify` - Check the ledger invariants

mod commands;
mod config;
mod systems;

use clap::{Parser, Subcommand};
use commands::migrate::MigrateArgs;
use commands::records::RecordFilter;
use commands::Context;
use config::CliConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Idempotent entity migrations between systems.
#[derive(Parser)]
#[command(name = "carryover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(global = true, short, long, default_value = "carryover.json")]
    config: PathBuf,

    /// Path to the ledger log (overrides the config file)
    #[arg(global = true, short, long)]
    ledger: Option<PathBuf>,

    /// Owner records are written for (overrides the config file)
    #[arg(global = true, short, long)]
    owner: Option<String>,

    /// HTTP timeout in seconds
    #[arg(global = true, long, default_value = "30")]
    timeout: u64,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage a system's export as pending records
    Stage {
        /// System to read
        system: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Migrate records from a source to a destination
    Migrate {
        /// Source system
        source: String,

        /// Destination system
        destination: String,

        /// Only migrate this entity kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum number of items to claim
        #[arg(short, long)]
        max: Option<usize>,

        /// Stage the source export first
        #[arg(short, long)]
        stage: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display per-kind record counts
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List ledger records
    Records {
        /// Entity kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Record status (pending, success, failed, skipped)
        #[arg(short, long)]
        status: Option<String>,

        /// Source system
        #[arg(long)]
        source: Option<String>,

        /// Destination system
        #[arg(long)]
        destination: Option<String>,

        /// Maximum number of records to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the ledger invariants
    Verify {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("carryover v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = CliConfig::load(&cli.config)?;
    let ctx = Context {
        ledger_path: config.ledger_path(cli.ledger.as_deref()),
        config,
        owner: cli.owner,
        timeout: Duration::from_secs(cli.timeout),
    };

    match cli.command {
        Commands::Stage { system, format } => commands::stage::run(&ctx, &system, &format)?,
        Commands::Migrate {
            source,
            destination,
            kind,
            max,
            stage,
            format,
        } => {
            let args = MigrateArgs {
                source,
                destination,
                kind: kind.as_deref().map(str::parse).transpose()?,
                max,
                stage,
                format,
            };
            commands::migrate::run(&ctx, &args)?;
        }
        Commands::Status { format } => commands::status::run(&ctx, &format)?,
        Commands::Records {
            kind,
            status,
            source,
            destination,
            limit,
            format,
        } => {
            let filter = RecordFilter {
                kind: kind.as_deref().map(str::parse).transpose()?,
                status: status.as_deref().map(str::parse).transpose()?,
                source,
                destination,
                limit,
            };
            commands::records::run(&ctx, &filter, &format)?;
        }
        Commands::Verify { format } => commands::verify::run(&ctx, &format)?,
        Commands::Version => {}
    }

    Ok(())
}
