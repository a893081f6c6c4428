//! CLI command implementations.

pub mod migrate;
pub mod records;
pub mod stage;
pub mod status;
pub mod verify;

use crate::config::CliConfig;
use crate::systems::{ConfigRegistry, EnvTokens};
use carryover_engine::MigrationEngine;
use carryover_ledger::Ledger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result type shared by the commands.
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Resolved global options.
#[derive(Debug)]
pub struct Context {
    /// Loaded config file.
    pub config: CliConfig,
    /// Ledger log path.
    pub ledger_path: PathBuf,
    /// Owner given on the command line.
    pub owner: Option<String>,
    /// HTTP timeout.
    pub timeout: Duration,
}

impl Context {
    /// Opens the ledger, creating it and its directory if needed.
    pub fn open_ledger(&self) -> CommandResult<Arc<Ledger>> {
        if let Some(dir) = self.ledger_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let ledger = Ledger::open(&self.ledger_path, self.config.ledger_config())?;
        let recovery = ledger.recovery();
        if recovery.truncated_bytes > 0 {
            tracing::warn!(
                path = %self.ledger_path.display(),
                bytes = recovery.truncated_bytes,
                reason = recovery.reason.as_deref().unwrap_or("torn tail"),
                "ledger tail truncated on open"
            );
        }
        Ok(Arc::new(ledger))
    }

    /// Opens an existing ledger; fails if there is none.
    pub fn existing_ledger(&self) -> CommandResult<Arc<Ledger>> {
        if !self.ledger_path.exists() {
            return Err(format!("no ledger found at {}", self.ledger_path.display()).into());
        }
        self.open_ledger()
    }

    /// Builds an engine over the configured systems.
    pub fn engine(&self) -> CommandResult<(MigrationEngine, Arc<ConfigRegistry>)> {
        let ledger = self.open_ledger()?;
        let registry = Arc::new(ConfigRegistry::new(self.config.systems.clone(), self.timeout));
        let tokens = Arc::new(EnvTokens::from_systems(&self.config.systems));
        let engine = MigrationEngine::new(
            ledger,
            Arc::clone(&registry) as Arc<dyn carryover_engine::SystemRegistry>,
            self.config.engine_config(self.owner.as_deref()),
        )
        .with_tokens(tokens);
        Ok((engine, registry))
    }
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
