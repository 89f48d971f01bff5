use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use migrator_infra::jobs::{Collaborators, ShutdownTrigger};
use migrator_infra::lock::RedisLock;
use migrator_infra::store::{
    PostgresMigrationFiles, PostgresRangeStore, PostgresSourceFiles, RetryPolicy, SeedPolicy,
};
use migrator_infra::{GlobalScheduler, Settings, StubFileMover};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    migrator_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let pool = Arc::new(
        PgPool::connect(&settings.database_url)
            .await
            .context("failed to connect to Postgres")?,
    );
    let lock = RedisLock::new(&settings.redis_url).context("invalid REDIS_URL")?;

    let seed_policy = SeedPolicy {
        batch_size: settings.batch_size,
        retention_minutes: settings.retention_minutes,
    };
    let retry_policy = RetryPolicy {
        batch_size: settings.retry_batch_size,
        max_retries: settings.max_retries,
    };
    let deps = Collaborators {
        lock: Arc::new(lock),
        sources: Arc::new(PostgresSourceFiles::new(pool.clone())),
        files: Arc::new(PostgresMigrationFiles::new(pool.clone(), retry_policy)),
        ranges: Arc::new(
            PostgresRangeStore::new(pool.clone(), seed_policy)
                .with_stale_after(settings.stale_range_after),
        ),
        mover: Arc::new(StubFileMover::new(
            settings.mover_failure_percent,
            settings.mover_target_prefix.clone(),
        )),
    };

    tracing::info!(
        global_locking = settings.enable_global_locking,
        job_threads = settings.job_threads,
        retry_threads = settings.retry_threads,
        "starting migration worker"
    );

    let process = ShutdownTrigger::new();
    let scheduler = tokio::spawn(GlobalScheduler::new(settings, deps, process.signal()).run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; draining job pools");
    process.trigger();

    scheduler.await.context("scheduler task failed")?;
    tracing::info!("migration worker stopped");
    Ok(())
}
