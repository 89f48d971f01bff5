//! Leader election over the job pools.
//!
//! One recurring check per process. With global locking enabled, only the
//! holder of [`GLOBAL_LOCK_KEY`] runs job pools; leadership is a value
//! returned by each attempt, never a flag read elsewhere.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::jobs::{Collaborators, JobPools, ShutdownSignal};
use crate::lock::{DistributedLock, LockError, OwnerToken};

pub const GLOBAL_LOCK_KEY: &str = "MIGRATION_GLOBAL_LOCK";

/// Re-check delay after a failed election attempt.
pub const ELECTION_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Outcome of one election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Acquired,
    HeldElsewhere,
}

/// What to do with the pools after an election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderAction {
    StartPools,
    KeepPools,
    StopPools,
    StayIdle,
}

pub fn plan_transition(running: bool, outcome: Leadership) -> LeaderAction {
    match (outcome, running) {
        (Leadership::Acquired, false) => LeaderAction::StartPools,
        (Leadership::Acquired, true) => LeaderAction::KeepPools,
        (Leadership::HeldElsewhere, true) => LeaderAction::StopPools,
        (Leadership::HeldElsewhere, false) => LeaderAction::StayIdle,
    }
}

/// Competes for the global lock with one token for the process lifetime.
pub struct LeaderElection {
    lock: Arc<dyn DistributedLock>,
    token: OwnerToken,
    ttl: Duration,
}

impl LeaderElection {
    pub fn new(lock: Arc<dyn DistributedLock>, ttl: Duration) -> Self {
        Self {
            lock,
            token: OwnerToken::new(),
            ttl,
        }
    }

    pub fn token(&self) -> OwnerToken {
        self.token
    }

    /// Take the lock if free, or extend it if this process already holds it.
    pub async fn attempt(&self) -> Result<Leadership, LockError> {
        if self.lock.acquire(GLOBAL_LOCK_KEY, &self.token, self.ttl).await? {
            return Ok(Leadership::Acquired);
        }
        if self.lock.renew(GLOBAL_LOCK_KEY, &self.token, self.ttl).await? {
            return Ok(Leadership::Acquired);
        }
        Ok(Leadership::HeldElsewhere)
    }

    /// Give up the lock if still held.
    pub async fn resign(&self) -> Result<bool, LockError> {
        self.lock.release(GLOBAL_LOCK_KEY, &self.token).await
    }
}

/// Starts job pools on the leader and stops them when leadership moves.
pub struct GlobalScheduler {
    settings: Settings,
    deps: Collaborators,
    shutdown: ShutdownSignal,
}

impl GlobalScheduler {
    pub fn new(settings: Settings, deps: Collaborators, shutdown: ShutdownSignal) -> Self {
        Self {
            settings,
            deps,
            shutdown,
        }
    }

    /// Run until the process shutdown signal fires.
    pub async fn run(mut self) {
        if !self.settings.enable_global_locking {
            info!("global locking disabled; starting job pools");
            let pools = JobPools::start(&self.settings, &self.deps, &self.shutdown);
            self.shutdown.wait().await;
            pools.shutdown().await;
            return;
        }

        let ttl = self.settings.global_lock_ttl;
        let election = LeaderElection::new(self.deps.lock.clone(), ttl);
        let mut pools: Option<JobPools> = None;

        loop {
            info!(token = %election.token(), "running global schedule check");
            let delay = match election.attempt().await {
                Ok(outcome) => {
                    match plan_transition(pools.is_some(), outcome) {
                        LeaderAction::StartPools => {
                            info!("acquired global lock; starting job pools");
                            pools = Some(JobPools::start(&self.settings, &self.deps, &self.shutdown));
                        }
                        LeaderAction::KeepPools => {
                            info!("still holding global lock; continuing migration");
                        }
                        LeaderAction::StopPools => {
                            warn!("global lock moved to another process; stopping job pools");
                            if let Some(running) = pools.take() {
                                running.shutdown().await;
                            }
                        }
                        LeaderAction::StayIdle => {
                            info!(ttl_secs = ttl.as_secs(), "global lock held elsewhere; sleeping");
                        }
                    }
                    ttl
                }
                Err(e) => {
                    error!(error = %e, "global schedule check failed");
                    ELECTION_RETRY_DELAY
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(running) = pools.take() {
            running.shutdown().await;
            if let Err(e) = election.resign().await {
                warn!(error = %e, "failed to release global lock");
            }
        }
        info!("global scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::JobSettings;
    use crate::jobs::ShutdownTrigger;
    use crate::jobs::testing::Fixture;
    use crate::lock::InMemoryLock;
    use crate::mover::ScriptedMover;

    fn settings(locking: bool) -> Settings {
        let job = |delay: u64| JobSettings {
            enabled: true,
            window: None,
            default_delay: Duration::from_secs(delay),
        };
        Settings {
            enable_global_locking: locking,
            global_lock_ttl: Duration::from_secs(600),
            job_threads: 2,
            retry_threads: 1,
            seed: job(3_600),
            migration: job(0),
            retry: job(1_800),
            cleanup: job(3_600),
            ..Settings::default()
        }
    }

    fn collaborators(fixture: &Fixture) -> Collaborators {
        Collaborators {
            lock: fixture.lock.clone(),
            sources: fixture.sources.clone(),
            files: fixture.files.clone(),
            ranges: fixture.ranges.clone(),
            mover: Arc::new(ScriptedMover::default()),
        }
    }

    #[test]
    fn transitions_cover_every_case() {
        assert_eq!(plan_transition(false, Leadership::Acquired), LeaderAction::StartPools);
        assert_eq!(plan_transition(true, Leadership::Acquired), LeaderAction::KeepPools);
        assert_eq!(plan_transition(true, Leadership::HeldElsewhere), LeaderAction::StopPools);
        assert_eq!(plan_transition(false, Leadership::HeldElsewhere), LeaderAction::StayIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_keeps_lock_and_rival_waits_for_expiry() {
        let lock: Arc<InMemoryLock> = Arc::new(InMemoryLock::new());
        let ttl = Duration::from_secs(60);
        let leader = LeaderElection::new(lock.clone(), ttl);
        let rival = LeaderElection::new(lock.clone(), ttl);

        assert_eq!(leader.attempt().await.unwrap(), Leadership::Acquired);
        assert_eq!(rival.attempt().await.unwrap(), Leadership::HeldElsewhere);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(leader.attempt().await.unwrap(), Leadership::Acquired);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(rival.attempt().await.unwrap(), Leadership::HeldElsewhere);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rival.attempt().await.unwrap(), Leadership::Acquired);
        assert_eq!(leader.attempt().await.unwrap(), Leadership::HeldElsewhere);
        assert_eq!(lock.holder(GLOBAL_LOCK_KEY), Some(rival.token()));
    }

    #[tokio::test]
    async fn unreachable_lock_store_is_an_error_not_a_loss() {
        let lock = Arc::new(InMemoryLock::new());
        lock.set_unavailable(true);
        let election = LeaderElection::new(lock, Duration::from_secs(60));
        assert!(election.attempt().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn without_locking_pools_start_immediately() {
        let fixture = Fixture::new(1..=20, 10);
        let process = ShutdownTrigger::new();
        let scheduler = GlobalScheduler::new(settings(false), collaborators(&fixture), process.signal());
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fixture.ranges.ranges().len(), 2);
        assert_eq!(fixture.files.all().len(), 20);

        process.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn follower_never_starts_pools() {
        let fixture = Fixture::new(1..=20, 10);
        fixture
            .lock
            .acquire(GLOBAL_LOCK_KEY, &OwnerToken::new(), Duration::from_secs(86_400))
            .await
            .unwrap();
        let process = ShutdownTrigger::new();
        let scheduler = GlobalScheduler::new(settings(true), collaborators(&fixture), process.signal());
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(1_800)).await;
        assert!(fixture.ranges.ranges().is_empty());

        process.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn leader_runs_pools_and_resigns_on_shutdown() {
        let fixture = Fixture::new(1..=20, 10);
        let process = ShutdownTrigger::new();
        let scheduler = GlobalScheduler::new(settings(true), collaborators(&fixture), process.signal());
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fixture.lock.holder(GLOBAL_LOCK_KEY).is_some());
        assert_eq!(fixture.files.all().len(), 20);

        process.trigger();
        handle.await.unwrap();
        assert!(fixture.lock.holder(GLOBAL_LOCK_KEY).is_none());
    }
}
