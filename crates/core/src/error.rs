//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (parsing, invariants).
/// Store, lock and transport failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A persisted status string did not name a known variant.
    #[error("unknown {kind} status: {value:?}")]
    UnknownStatus { kind: &'static str, value: String },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn unknown_status(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownStatus {
            kind,
            value: value.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
