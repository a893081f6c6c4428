//! # Carryover Testkit
//!
//! Test utilities for carryover.
//!
//! This crate provides:
//! - Fixtures: entity builders, a ready-wired engine harness, temp ledgers
//! - Property-based test generators using proptest
//! - Concurrent-run helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use carryover_testkit::prelude::*;
//!
//! #[test]
//! fn coupon_is_created_once() {
//!     let h = Harness::new(source_with(EntityKind::Coupon, [coupon("c-1", "SAVE10")]));
//!     h.stage();
//!     assert_eq!(h.migrate().imported, 1);
//!     assert_eq!(h.migrate().imported, 0);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use carryover_engine::{
        EngineConfig, MappingMode, MemorySystem, MigrationEngine, MigrationSummary, RemoteSystem,
    };
    pub use carryover_ledger::{
        EntityKind, Ledger, MigrationRecord, RecordQuery, RecordStatus, SystemId,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
