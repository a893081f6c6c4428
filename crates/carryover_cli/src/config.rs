//! `carryover.json` loading.

use carryover_engine::{EngineConfig, MappingMode};
use carryover_ledger::LedgerConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Ledger file used when neither the config nor the flags name one.
pub const DEFAULT_LEDGER: &str = "ledger.log";

/// Errors reading the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but cannot be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid config JSON.
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Tuning knobs that override [`EngineConfig`] defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOverrides {
    /// Payloads per bulk call.
    pub chunk_size: Option<usize>,
    /// Items per list page.
    pub page_size: Option<usize>,
    /// Maximum pages per collection.
    pub page_ceiling: Option<usize>,
    /// `strict` or `lenient`.
    pub mapping_mode: Option<MappingMode>,
    /// Claim lease in seconds.
    pub claim_lease_secs: Option<u64>,
    /// Balance verification reads.
    pub verify_reads: Option<u32>,
    /// Pause between verification reads, in milliseconds.
    pub settle_delay_ms: Option<u64>,
    /// Sync the ledger file on every commit.
    pub sync_on_commit: Option<bool>,
}

/// How to reach one system.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SystemDef {
    /// A read-only export file, keyed by collection name.
    Export {
        /// Export file.
        path: PathBuf,
    },
    /// An in-memory system persisted as a snapshot after each command.
    Snapshot {
        /// Snapshot file, created on first save.
        path: PathBuf,
    },
    /// A JSON REST service.
    Http {
        /// Base URL.
        base_url: String,
        /// Environment variable holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
        /// Server has `POST {collection}/bulk`.
        #[serde(default = "enabled")]
        bulk: bool,
        /// Server has `GET {collection}/lookup`.
        #[serde(default = "enabled")]
        lookup: bool,
        /// Server keeps balances.
        #[serde(default)]
        balances: bool,
        /// Server keeps order payments and fulfillments.
        #[serde(default)]
        orders: bool,
    },
}

fn enabled() -> bool {
    true
}

impl SystemDef {
    fn rebase(&mut self, base: &Path) {
        match self {
            Self::Export { path } | Self::Snapshot { path } if path.is_relative() => {
                *path = base.join(&*path);
            }
            _ => {}
        }
    }
}

/// The contents of `carryover.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Tenant records are written for.
    pub owner: Option<String>,
    /// Ledger log file.
    pub ledger: Option<PathBuf>,
    /// Engine tuning.
    pub engine: EngineOverrides,
    /// Known systems by ID.
    pub systems: BTreeMap<String, SystemDef>,
}

impl CliConfig {
    /// Reads `path`. A missing file yields the default configuration.
    ///
    /// Relative paths inside the file are resolved against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.rebase(base);
        Ok(config)
    }

    /// Parses config JSON without touching paths.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn rebase(&mut self, base: &Path) {
        if let Some(ledger) = self.ledger.as_mut().filter(|p| p.is_relative()) {
            *ledger = base.join(&*ledger);
        }
        for system in self.systems.values_mut() {
            system.rebase(base);
        }
    }

    /// Ledger path: the flag, else the file, else [`DEFAULT_LEDGER`].
    pub fn ledger_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.ledger.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER))
    }

    /// Engine configuration with every override applied.
    pub fn engine_config(&self, owner_flag: Option<&str>) -> EngineConfig {
        let owner = owner_flag
            .map(str::to_string)
            .or_else(|| self.owner.clone())
            .unwrap_or_else(|| "default".to_string());
        let o = &self.engine;
        let mut config = EngineConfig::new(owner);
        if let Some(size) = o.chunk_size {
            config = config.with_chunk_size(size);
        }
        if let Some(size) = o.page_size {
            config = config.with_page_size(size);
        }
        if let Some(pages) = o.page_ceiling {
            config = config.with_page_ceiling(pages);
        }
        if let Some(mode) = o.mapping_mode {
            config = config.with_mapping_mode(mode);
        }
        if let Some(secs) = o.claim_lease_secs {
            config = config.with_claim_lease(Duration::from_secs(secs));
        }
        if let Some(reads) = o.verify_reads {
            config = config.with_verify_reads(reads);
        }
        if let Some(ms) = o.settle_delay_ms {
            config = config.with_settle_delay(Duration::from_millis(ms));
        }
        config
    }

    /// Ledger configuration.
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig::new().sync_on_commit(self.engine.sync_on_commit.unwrap_or(true))
    }
}
