//! Migrates one claimed range per iteration.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use migrator_core::{BackoffCounter, MigrationFile, MigrationRange, RangeId, RangeStatus};

use super::runner::{Job, Reschedule};
use super::{FAILURE_RETRY_DELAY, JOB_LOCK_TTL, JobError, release_lock};
use crate::config::JobSettings;
use crate::lock::{DistributedLock, OwnerToken};
use crate::mover::FileMover;
use crate::store::{MigrationFileStore, RangeStore, SourceFileReader};

/// Migration workers poll aggressively while ranges keep appearing.
pub const MIGRATION_BACKOFF_SECS: [u64; 4] = [10, 30, 60, 300];

/// Per-range lock key.
pub fn range_lock_key(range_id: RangeId) -> String {
    format!("FILE_MIGRATION_{range_id}")
}

/// Counts for one migrated range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOutcome {
    pub processed: usize,
    pub failed: usize,
}

pub struct MigrationJob {
    settings: JobSettings,
    lock: Arc<dyn DistributedLock>,
    ranges: Arc<dyn RangeStore>,
    sources: Arc<dyn SourceFileReader>,
    files: Arc<dyn MigrationFileStore>,
    mover: Arc<dyn FileMover>,
}

impl MigrationJob {
    pub fn new(
        settings: JobSettings,
        lock: Arc<dyn DistributedLock>,
        ranges: Arc<dyn RangeStore>,
        sources: Arc<dyn SourceFileReader>,
        files: Arc<dyn MigrationFileStore>,
        mover: Arc<dyn FileMover>,
    ) -> Self {
        Self {
            settings,
            lock,
            ranges,
            sources,
            files,
            mover,
        }
    }

    /// Move every file of a range this worker has already started.
    async fn migrate(&self, range: &MigrationRange) -> Result<RangeOutcome, JobError> {
        let sources = self.sources.fetch(range.span).await?;
        let mut records = Vec::with_capacity(sources.len());
        let mut failed = 0;
        for source in &sources {
            let record = match self.mover.relocate(source).await {
                Ok(new_uri) => MigrationFile::succeeded(source, new_uri, Utc::now()),
                Err(e) => {
                    failed += 1;
                    warn!(job = self.name(), file_id = %source.id, uri = %source.uri, error = %e, "file move failed");
                    MigrationFile::failed(source, Utc::now())
                }
            };
            records.push(record);
        }

        if !records.is_empty() {
            self.files.upsert(&records).await?;
        }
        self.ranges.set_status(range.id, RangeStatus::Complete).await?;

        Ok(RangeOutcome {
            processed: records.len(),
            failed,
        })
    }
}

#[async_trait]
impl Job for MigrationJob {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn backoff_periods(&self) -> &[u64] {
        &MIGRATION_BACKOFF_SECS
    }

    async fn process(&mut self, backoff: &mut BackoffCounter) -> Reschedule {
        let range = match self.ranges.claim_next_pending().await {
            Ok(Some(range)) => range,
            Ok(None) => {
                info!(job = self.name(), "no migration ranges available");
                backoff.increment();
                return Reschedule::Default;
            }
            Err(e) => {
                error!(job = self.name(), error = %e, "failed to claim migration range");
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        };

        let owner = OwnerToken::new();
        let key = range_lock_key(range.id);
        match self.lock.acquire(&key, &owner, JOB_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job = self.name(), range_id = %range.id, "range locked by another worker");
                return Reschedule::Default;
            }
            Err(e) => {
                error!(job = self.name(), range_id = %range.id, error = %e, "failed to acquire range lock");
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        }

        // The candidate may have been finished by another worker between the
        // read and the lock; only a PENDING -> PROCESSING transition proceeds.
        match self.ranges.start_processing(range.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job = self.name(), range_id = %range.id, "range already taken");
                return if release_lock(&*self.lock, &key, &owner, self.name()).await {
                    Reschedule::Default
                } else {
                    Reschedule::After(FAILURE_RETRY_DELAY)
                };
            }
            Err(e) => {
                error!(job = self.name(), range_id = %range.id, error = %e, "failed to start range");
                release_lock(&*self.lock, &key, &owner, self.name()).await;
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        }

        match self.migrate(&range).await {
            Ok(outcome) => {
                info!(
                    job = self.name(),
                    range_id = %range.id,
                    processed = outcome.processed,
                    failed = outcome.failed,
                    "range migrated"
                );
                backoff.reset();
            }
            Err(e) => {
                error!(job = self.name(), range_id = %range.id, error = %e, "range migration failed");
                if let Err(revert) = self.ranges.set_status(range.id, RangeStatus::Pending).await {
                    error!(
                        job = self.name(),
                        range_id = %range.id,
                        error = %revert,
                        "failed to return range to pending"
                    );
                }
            }
        }

        if release_lock(&*self.lock, &key, &owner, self.name()).await {
            Reschedule::Default
        } else {
            Reschedule::After(FAILURE_RETRY_DELAY)
        }
    }
}
