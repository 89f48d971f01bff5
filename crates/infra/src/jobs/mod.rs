//! Self-rescheduling migration jobs.
//!
//! ## Components
//!
//! - `JobRunner`: generic loop (gate, process, re-arm) driving one `Job`
//! - `SeedJob`, `MigrationJob`, `RetryJob`, `CleanupJob`: the concrete work
//! - `JobPools`: the four pools a leader runs
//! - `ShutdownTrigger` / `ShutdownSignal`: cooperative drain
//!
//! Job-level exclusion uses the distributed lock with a fresh owner token per
//! execution. Lock contention is not an error; the run just declines.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::lock::{DistributedLock, LockError, OwnerToken};
use crate::store::StoreError;

pub mod cleanup;
pub mod migration;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod seed;
pub mod shutdown;
pub mod window;

pub use cleanup::CleanupJob;
pub use migration::MigrationJob;
pub use pool::{Collaborators, JobPool, JobPools};
pub use retry::RetryJob;
pub use runner::{Gate, Job, JobRunner, Reschedule, should_run};
pub use seed::SeedJob;
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use window::{WindowGate, check_window};

/// Failure inside one job iteration.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Backoff used by jobs that don't override it.
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [30, 300, 600, 1800, 3600];

/// Re-arm delay after a failure that may have skipped the normal reschedule.
pub const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(300);

/// TTL of job-level and per-range locks.
pub const JOB_LOCK_TTL: Duration = Duration::from_secs(1800);

/// Release a job lock, logging (not propagating) failures.
///
/// Returns `false` when the coordination store could not be reached.
pub(crate) async fn release_lock(
    lock: &dyn DistributedLock,
    key: &str,
    owner: &OwnerToken,
    job: &'static str,
) -> bool {
    match lock.release(key, owner).await {
        Ok(_) => true,
        Err(e) => {
            warn!(job, lock_key = key, error = %e, "failed to release lock");
            false
        }
    }
}
