//! Range seeding: initial partition of the retention window, then expansion
//! as new source ids appear.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use migrator_core::BackoffCounter;

use super::runner::{Job, Reschedule};
use super::{FAILURE_RETRY_DELAY, JOB_LOCK_TTL, JobError, release_lock};
use crate::config::JobSettings;
use crate::lock::{DistributedLock, OwnerToken};
use crate::store::RangeStore;

pub const SEED_LOCK_KEY: &str = "SEED_JOB";

pub struct SeedJob {
    settings: JobSettings,
    lock: Arc<dyn DistributedLock>,
    ranges: Arc<dyn RangeStore>,
}

impl SeedJob {
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

    async fn seed(&self) -> Result<usize, JobError> {
        let init = !self.ranges.is_seeded().await?;
        let created = self.ranges.seed(init).await?;
        info!(job = self.name(), init, created, "seeded migration ranges");
        Ok(created)
    }
}

#[async_trait]
impl Job for SeedJob {
    fn name(&self) -> &'static str {
        "seed"
    }

    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    async fn process(&mut self, _backoff: &mut BackoffCounter) -> Reschedule {
        let owner = OwnerToken::new();
        match self.lock.acquire(SEED_LOCK_KEY, &owner, JOB_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job = self.name(), "seed lock held elsewhere");
                return Reschedule::Default;
            }
            Err(e) => {
                error!(job = self.name(), error = %e, "failed to acquire seed lock");
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        }

        if let Err(e) = self.seed().await {
            error!(job = self.name(), error = %e, "failed to seed migration ranges");
        }

        if release_lock(&*self.lock, SEED_LOCK_KEY, &owner, self.name()).await {
            Reschedule::Default
        } else {
            Reschedule::After(FAILURE_RETRY_DELAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use migrator_core::{IdSpan, RangeStatus};

    use crate::jobs::testing::{Fixture, settings};

    fn job(fixture: &Fixture) -> SeedJob {
        SeedJob::new(settings(), fixture.lock.clone(), fixture.ranges.clone())
    }

    fn backoff() -> BackoffCounter {
        BackoffCounter::from_secs(&[30])
    }

    #[tokio::test]
    async fn first_run_partitions_source_then_expands() {
        let fixture = Fixture::new([1, 9_000, 25_001], 10_000);
        let mut seed = job(&fixture);

        assert_eq!(seed.process(&mut backoff()).await, Reschedule::Default);
        let spans: Vec<_> = fixture.ranges.ranges().iter().map(|r| r.span).collect();
        assert_eq!(
            spans,
            vec![
                IdSpan { min: 1, max: 10_000 },
                IdSpan { min: 10_001, max: 20_000 },
                IdSpan { min: 20_001, max: 25_001 },
            ]
        );
        assert!(
            fixture
                .ranges
                .ranges()
                .iter()
                .all(|r| r.status == RangeStatus::Pending)
        );

        seed.process(&mut backoff()).await;
        assert_eq!(fixture.ranges.ranges().len(), 3);

        fixture.sources.insert(crate::jobs::testing::source_file(26_000));
        seed.process(&mut backoff()).await;
        let last = fixture.ranges.ranges().last().cloned().unwrap();
        assert_eq!(last.span, IdSpan { min: 25_002, max: 26_000 });
    }

    #[tokio::test]
    async fn lock_is_released_after_each_run() {
        let fixture = Fixture::new([1, 2, 3], 10);
        job(&fixture).process(&mut backoff()).await;
        assert!(fixture.lock.holder(SEED_LOCK_KEY).is_none());
    }

    #[tokio::test]
    async fn contended_lock_declines_without_seeding() {
        let fixture = Fixture::new([1, 2, 3], 10);
        fixture
            .lock
            .acquire(SEED_LOCK_KEY, &OwnerToken::new(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(job(&fixture).process(&mut backoff()).await, Reschedule::Default);
        assert!(fixture.ranges.ranges().is_empty());
    }

    #[tokio::test]
    async fn unreachable_lock_store_retries_later() {
        let fixture = Fixture::new([1, 2, 3], 10);
        fixture.lock.set_unavailable(true);

        assert_eq!(
            job(&fixture).process(&mut backoff()).await,
            Reschedule::After(FAILURE_RETRY_DELAY)
        );
    }

    #[tokio::test]
    async fn store_failure_still_releases_lock() {
        let fixture = Fixture::new([1, 2, 3], 10);
        fixture.ranges.set_unavailable(true);

        assert_eq!(job(&fixture).process(&mut backoff()).await, Reschedule::Default);
        assert!(fixture.lock.holder(SEED_LOCK_KEY).is_none());
    }
}
