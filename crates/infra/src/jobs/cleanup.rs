//! Hands abandoned `Processing` ranges back to `Pending`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use migrator_core::BackoffCounter;

use super::runner::{Job, Reschedule};
use super::{FAILURE_RETRY_DELAY, JOB_LOCK_TTL, release_lock};
use crate::config::JobSettings;
use crate::lock::{DistributedLock, OwnerToken};
use crate::store::RangeStore;

pub const CLEANUP_LOCK_KEY: &str = "CLEANUP_JOB";

pub struct CleanupJob {
    settings: JobSettings,
    lock: Arc<dyn DistributedLock>,
    ranges: Arc<dyn RangeStore>,
}

impl CleanupJob {
    pub fn new(
        settings: JobSettings,
        lock: Arc<dyn DistributedLock>,
        ranges: Arc<dyn RangeStore>,
    ) -> Self {
        Self {
            settings,
            lock,
            ranges,
        }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    async fn process(&mut self, _backoff: &mut BackoffCounter) -> Reschedule {
        let owner = OwnerToken::new();
        match self.lock.acquire(CLEANUP_LOCK_KEY, &owner, JOB_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job = self.name(), "cleanup lock held elsewhere");
                return Reschedule::Default;
            }
            Err(e) => {
                error!(job = self.name(), error = %e, "failed to acquire cleanup lock");
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        }

        match self.ranges.reclaim_stale().await {
            Ok(0) => debug!(job = self.name(), "no stale ranges"),
            Ok(reclaimed) => info!(job = self.name(), reclaimed, "returned stale ranges to pending"),
            Err(e) => error!(job = self.name(), error = %e, "failed to reclaim stale ranges"),
        }

        if release_lock(&*self.lock, CLEANUP_LOCK_KEY, &owner, self.name()).await {
            Reschedule::Default
        } else {
            Reschedule::After(FAILURE_RETRY_DELAY)
        }
    }
}
