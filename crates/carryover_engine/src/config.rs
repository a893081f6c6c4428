//! Engine configuration.

use carryover_ledger::OwnerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use carryover_ledger::RetryConfig;

/// What to do with a scope reference that cannot be mapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Reject the entity before any destination call.
    #[default]
    Strict,
    /// Drop the unmappable reference and widen the entity's scope.
    Lenient,
}

/// Configuration for a migration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tenant every record is written for.
    pub owner: OwnerId,
    /// Payloads per bulk-create call.
    pub chunk_size: usize,
    /// Items requested per list page.
    pub page_size: usize,
    /// Hard cap on pages read from one collection.
    pub page_ceiling: usize,
    /// Handling of unmappable scope references.
    pub mapping_mode: MappingMode,
    /// How long a claim keeps other runs away from a pending record.
    pub claim_lease: Duration,
    /// Reads allowed when verifying a balance write.
    pub verify_reads: u32,
    /// Pause between balance verification reads.
    pub settle_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner: OwnerId::new("default"),
            chunk_size: 50,
            page_size: 100,
            page_ceiling: 500,
            mapping_mode: MappingMode::Strict,
            claim_lease: Duration::from_secs(15 * 60),
            verify_reads: 3,
            settle_delay: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for `owner` with default values.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: OwnerId::new(owner),
            ..Self::default()
        }
    }

    /// Sets the bulk chunk size (at least 1).
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets the list page size (at least 1).
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the page ceiling.
    #[must_use]
    pub fn with_page_ceiling(mut self, pages: usize) -> Self {
        self.page_ceiling = pages;
        self
    }

    /// Sets the mapping mode.
    #[must_use]
    pub fn with_mapping_mode(mut self, mode: MappingMode) -> Self {
        self.mapping_mode = mode;
        self
    }

    /// Sets the claim lease.
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Sets how many reads balance verification may take.
    #[must_use]
    pub fn with_verify_reads(mut self, reads: u32) -> Self {
        self.verify_reads = reads.max(1);
        self
    }

    /// Sets the pause between verification reads.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// The claim lease as a `chrono` duration.
    #[must_use]
    pub fn claim_lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.claim_lease).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.page_ceiling, 500);
        assert_eq!(config.mapping_mode, MappingMode::Strict);
        assert_eq!(config.claim_lease, Duration::from_secs(900));
        assert_eq!(config.verify_reads, 3);
        assert_eq!(config.settle_delay, Duration::from_millis(50));
    }

    #[test]
    fn builder_clamps_sizes() {
        let config = EngineConfig::new("acme")
            .with_chunk_size(0)
            .with_page_size(0)
            .with_verify_reads(0)
            .with_mapping_mode(MappingMode::Lenient);
        assert_eq!(config.owner.as_str(), "acme");
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.verify_reads, 1);
        assert_eq!(config.mapping_mode, MappingMode::Lenient);
    }

    #[test]
    fn lease_converts() {
        let config = EngineConfig::default().with_claim_lease(Duration::from_secs(60));
        assert_eq!(config.claim_lease_chrono(), chrono::Duration::minutes(1));
    }
}
