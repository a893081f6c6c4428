//! Error types for the migration engine.

use carryover_ledger::{EntityKind, LedgerError, SystemId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while migrating.
///
/// Only [`EngineError::Ledger`] aborts a run. Every other variant is
/// recorded against the item it happened to and counted in the summary.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The ledger failed, or a claim transaction ran out of retries.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A remote call failed as a whole.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Raw response body, kept as evidence.
        raw: Option<String>,
        /// Whether the call could succeed if repeated.
        retryable: bool,
    },

    /// A cross-reference could not be mapped to the destination.
    #[error("cannot map {field} {source_id} to a {target} in the destination")]
    Mapping {
        /// Payload field holding the reference.
        field: String,
        /// Referenced entity kind.
        target: EntityKind,
        /// The unmapped source ID.
        source_id: String,
    },

    /// A source item lacks a required field.
    #[error("invalid {kind}: {message}")]
    Validation {
        /// Entity kind.
        kind: EntityKind,
        /// What is missing.
        message: String,
    },

    /// An optimistic-concurrency write was rejected.
    #[error("revision conflict on {resource}: expected revision {expected}")]
    ConcurrencyConflict {
        /// Resource written.
        resource: String,
        /// Revision the write carried.
        expected: u64,
    },

    /// A collaborator returned something the engine cannot use.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// No system with this ID is configured.
    #[error("unknown system: {0}")]
    UnknownSystem(SystemId),

    /// The collaborator does not offer a capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Balance arithmetic left the `i64` range.
    #[error("balance overflow on {resource}: {message}")]
    BalanceOverflow {
        /// Resource written.
        resource: String,
        /// The operation that overflowed.
        message: String,
    },
}

impl EngineError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>, raw: Option<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            raw,
            retryable,
        }
    }

    /// Creates a validation error.
    pub fn validation(kind: EntityKind, message: impl Into<String>) -> Self {
        Self::Validation {
            kind,
            message: message.into(),
        }
    }

    /// Returns true if the error must abort the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Ledger(_))
    }

    /// Message to store on the affected record. Transport errors carry the
    /// raw response verbatim.
    #[must_use]
    pub fn record_message(&self) -> String {
        match self {
            Self::Transport {
                message,
                raw: Some(raw),
                ..
            } => format!("{message}: {raw}"),
            Self::Transport { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
