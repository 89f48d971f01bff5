//! Worker pools started by the current leader.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info};

use super::cleanup::CleanupJob;
use super::migration::MigrationJob;
use super::retry::RetryJob;
use super::runner::{Job, JobRunner};
use super::seed::SeedJob;
use super::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::config::Settings;
use crate::lock::DistributedLock;
use crate::mover::FileMover;
use crate::store::{MigrationFileStore, RangeStore, SourceFileReader};

pub const SEED_INITIAL_DELAY: Duration = Duration::ZERO;
pub const MIGRATION_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(30);
pub const CLEANUP_INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Shared handles every job is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub lock: Arc<dyn DistributedLock>,
    pub sources: Arc<dyn SourceFileReader>,
    pub files: Arc<dyn MigrationFileStore>,
    pub ranges: Arc<dyn RangeStore>,
    pub mover: Arc<dyn FileMover>,
}

/// `size` runners of one job family, stoppable as a unit.
pub struct JobPool {
    name: &'static str,
    trigger: ShutdownTrigger,
    tasks: JoinSet<()>,
}

impl JobPool {
    pub fn spawn<F>(
        name: &'static str,
        size: usize,
        initial_delay: Duration,
        shutdown: &ShutdownSignal,
        mut make_job: F,
    ) -> Self
    where
        F: FnMut() -> Box<dyn Job>,
    {
        let trigger = ShutdownTrigger::new();
        let mut tasks = JoinSet::new();
        for _ in 0..size {
            let runner = JobRunner::new(make_job(), shutdown.with_pool(&trigger));
            tasks.spawn(runner.run(initial_delay));
        }
        info!(pool = name, size, "job pool started");
        Self {
            name,
            trigger,
            tasks,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop re-arming and wait for in-flight iterations to finish.
    pub async fn shutdown(mut self) {
        self.trigger.trigger();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(pool = self.name, error = %e, "job runner ended abnormally");
            }
        }
        info!(pool = self.name, "job pool stopped");
    }
}

/// The four pools: seed, migration, retry, cleanup.
pub struct JobPools {
    pools: Vec<JobPool>,
}

impl JobPools {
    pub fn start(settings: &Settings, deps: &Collaborators, shutdown: &ShutdownSignal) -> Self {
        let seed = JobPool::spawn("seed", 1, SEED_INITIAL_DELAY, shutdown, || {
            Box::new(SeedJob::new(
                settings.seed.clone(),
                deps.lock.clone(),
                deps.ranges.clone(),
            ))
        });

        let migration = JobPool::spawn(
            "migration",
            settings.job_threads,
            MIGRATION_INITIAL_DELAY,
            shutdown,
            || {
                Box::new(MigrationJob::new(
                    settings.migration.clone(),
                    deps.lock.clone(),
                    deps.ranges.clone(),
                    deps.sources.clone(),
                    deps.files.clone(),
                    deps.mover.clone(),
                ))
            },
        );

        let retry = JobPool::spawn(
            "retry",
            settings.retry_threads,
            RETRY_INITIAL_DELAY,
            shutdown,
            || {
                Box::new(RetryJob::new(
                    settings.retry.clone(),
                    deps.files.clone(),
                    deps.mover.clone(),
                ))
            },
        );

        let cleanup = JobPool::spawn("cleanup", 1, CLEANUP_INITIAL_DELAY, shutdown, || {
            Box::new(CleanupJob::new(
                settings.cleanup.clone(),
                deps.lock.clone(),
                deps.ranges.clone(),
            ))
        });

        Self {
            pools: vec![seed, migration, retry, cleanup],
        }
    }

    /// Live runner count per pool.
    pub fn sizes(&self) -> Vec<(&'static str, usize)> {
        self.pools.iter().map(|p| (p.name, p.len())).collect()
    }

    pub async fn shutdown(self) {
        for pool in self.pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use migrator_core::{MigrationStatus, RangeStatus};

    use crate::config::JobSettings;
    use crate::jobs::testing::Fixture;
    use crate::mover::ScriptedMover;

    fn enabled_settings(threads: usize) -> Settings {
        let job = |delay: u64| JobSettings {
            enabled: true,
            window: None,
            default_delay: Duration::from_secs(delay),
        };
        Settings {
            job_threads: threads,
            retry_threads: 2,
            seed: job(3_600),
            migration: job(0),
            retry: job(1_800),
            cleanup: job(3_600),
            ..Settings::default()
        }
    }

    fn collaborators(fixture: &Fixture, mover: ScriptedMover) -> Collaborators {
        Collaborators {
            lock: fixture.lock.clone(),
            sources: fixture.sources.clone(),
            files: fixture.files.clone(),
            ranges: fixture.ranges.clone(),
            mover: Arc::new(mover),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pools_seed_migrate_and_retry_end_to_end() {
        let fixture = Fixture::new(1..=95, 10);
        let process = ShutdownTrigger::new();
        let pools = JobPools::start(
            &enabled_settings(4),
            &collaborators(&fixture, ScriptedMover::failing([13, 57])),
            &process.signal(),
        );
        assert_eq!(
            pools.sizes(),
            vec![("seed", 1), ("migration", 4), ("retry", 2), ("cleanup", 1)]
        );

        tokio::time::sleep(Duration::from_secs(120)).await;

        let ranges = fixture.ranges.ranges();
        assert_eq!(ranges.len(), 10);
        assert!(ranges.iter().all(|r| r.status == RangeStatus::Complete));

        let records = fixture.files.all();
        assert_eq!(records.len(), 95);
        let failed: Vec<_> = records
            .iter()
            .filter(|r| r.status == MigrationStatus::Fail)
            .map(|r| r.id.get())
            .collect();
        assert_eq!(failed, vec![13, 57]);
        assert!(records.iter().filter(|r| r.id.get() == 13).all(|r| r.retry_count >= 1));

        pools.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn process_shutdown_drains_every_pool() {
        let fixture = Fixture::new([], 10);
        let process = ShutdownTrigger::new();
        let pools = JobPools::start(
            &enabled_settings(3),
            &collaborators(&fixture, ScriptedMover::default()),
            &process.signal(),
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        process.trigger();
        tokio::time::timeout(Duration::from_secs(5), pools.shutdown())
            .await
            .expect("pools drain promptly");
    }
}
