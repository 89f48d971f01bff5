//! `migrator-core` — domain building blocks for the file migration workers.
//!
//! This crate contains **pure domain** primitives (no IO): the records the
//! jobs move around, range planning, and the backoff counter.

pub mod backoff;
pub mod entity;
pub mod error;
pub mod file;
pub mod id;
pub mod range;

pub use backoff::BackoffCounter;
pub use entity::Entity;
pub use error::DomainError;
pub use file::{MigrationFile, MigrationStatus, SourceFile};
pub use id::{FileId, RangeId};
pub use range::{
    IdSpan, MigrationRange, RangeStatus, expansion_span, plan_ranges, retention_cutoff,
};
