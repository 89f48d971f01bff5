//! Persistence seams for source files, migration records and ranges.
//!
//! The jobs only see these traits. Two implementations exist for each:
//! Postgres (production) and in-memory (tests/dev). Every batch write is
//! all-or-nothing. The two claim operations (`RangeStore::start_processing`
//! and `MigrationFileStore::claim_failures_for_retry`) are single atomic
//! transitions, so concurrent workers never both win the same unit of work.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use migrator_core::{DomainError, IdSpan, MigrationFile, MigrationRange, RangeId, RangeStatus, SourceFile};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryMigrationFiles, InMemoryRangeStore, InMemorySourceFiles};
pub use postgres::{PostgresMigrationFiles, PostgresRangeStore, PostgresSourceFiles};

/// Result type used by every store.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence failure.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("persistence store unreachable: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error(transparent)]
    InvalidData(#[from] DomainError),
}

/// How ranges are carved out of the source id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPolicy {
    /// Maximum number of ids per range.
    pub batch_size: u32,
    /// Look-back window (minutes) for the first seed.
    pub retention_minutes: u64,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            retention_minutes: 525_600,
        }
    }
}

/// Which failed records are eligible for a retry claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum records per claim.
    pub batch_size: u32,
    /// Records with this many retries or more are never claimed again.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
        }
    }
}

/// Default age after which a `Processing` range counts as abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Read-only access to the source system's file rows.
#[async_trait]
pub trait SourceFileReader: Send + Sync {
    /// All files whose id falls inside `span` (inclusive).
    async fn fetch(&self, span: IdSpan) -> StoreResult<Vec<SourceFile>>;
}

/// Migration records owned by this subsystem.
#[async_trait]
pub trait MigrationFileStore: Send + Sync {
    /// Insert first-attempt records; an existing record only takes the new
    /// location and status.
    async fn upsert(&self, records: &[MigrationFile]) -> StoreResult<()>;

    /// Write back the outcome of a retry batch (location, status, retry count).
    async fn upsert_retry_batch(&self, records: &[MigrationFile]) -> StoreResult<()>;

    /// Atomically claim up to the policy's batch of `Fail` records below the
    /// retry ceiling, oldest attempt first, moving them to `Retrying`.
    async fn claim_failures_for_retry(&self) -> StoreResult<Vec<MigrationFile>>;
}

/// Range rows and their lifecycle.
#[async_trait]
pub trait RangeStore: Send + Sync {
    async fn set_status(&self, range_id: RangeId, status: RangeStatus) -> StoreResult<()>;

    /// Lowest-id `Pending` range, if any. This is only a candidate: the
    /// row may be taken by another worker before `start_processing`.
    async fn claim_next_pending(&self) -> StoreResult<Option<MigrationRange>>;

    /// Move the range from `Pending` to `Processing` if it is still pending.
    /// Returns `false` when another worker already took (or finished) it.
    async fn start_processing(&self, range_id: RangeId) -> StoreResult<bool>;

    /// Create `Pending` ranges. With `init` the whole retention window is
    /// covered; otherwise coverage is extended past the current maximum.
    /// Returns the number of ranges created.
    async fn seed(&self, init: bool) -> StoreResult<usize>;

    /// Whether any range row exists.
    async fn is_seeded(&self) -> StoreResult<bool>;

    /// Return stale `Processing` ranges to `Pending`; yields how many moved.
    async fn reclaim_stale(&self) -> StoreResult<u64>;
}
