//! Re-attempts failed file moves in claimed batches.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use migrator_core::{BackoffCounter, MigrationFile, MigrationStatus};

use super::FAILURE_RETRY_DELAY;
use super::runner::{Job, Reschedule};
use crate::config::JobSettings;
use crate::mover::FileMover;
use crate::store::MigrationFileStore;

pub struct RetryJob {
    settings: JobSettings,
    files: Arc<dyn MigrationFileStore>,
    mover: Arc<dyn FileMover>,
}

impl RetryJob {
    pub fn new(
        settings: JobSettings,
        files: Arc<dyn MigrationFileStore>,
        mover: Arc<dyn FileMover>,
    ) -> Self {
        Self {
            settings,
            files,
            mover,
        }
    }

    async fn retry(&self, record: &MigrationFile) -> MigrationFile {
        match self.mover.relocate(&record.to_source()).await {
            Ok(new_uri) => record.retry_succeeded(new_uri, Utc::now()),
            Err(e) => {
                warn!(
                    job = self.name(),
                    file_id = %record.id,
                    uri = %record.old_uri,
                    retry_count = record.retry_count,
                    error = %e,
                    "file move failed again"
                );
                record.retry_failed(Utc::now())
            }
        }
    }
}

#[async_trait]
impl Job for RetryJob {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn settings(&self) -> &JobSettings {
        &self.settings
    }

    async fn process(&mut self, backoff: &mut BackoffCounter) -> Reschedule {
        let claimed = match self.files.claim_failures_for_retry().await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(job = self.name(), error = %e, "failed to claim failed migrations");
                return Reschedule::After(FAILURE_RETRY_DELAY);
            }
        };

        if claimed.is_empty() {
            info!(job = self.name(), "no failed migrations to retry");
            backoff.increment();
            return Reschedule::Default;
        }
        backoff.reset();

        let mut updated = Vec::with_capacity(claimed.len());
        for record in &claimed {
            updated.push(self.retry(record).await);
        }
        let failed = updated
            .iter()
            .filter(|r| r.status == MigrationStatus::Fail)
            .count();

        match self.files.upsert_retry_batch(&updated).await {
            Ok(()) => info!(job = self.name(), retried = updated.len(), failed, "retried failed migrations"),
            Err(e) => error!(job = self.name(), error = %e, "failed to persist retried migrations"),
        }
        Reschedule::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use migrator_core::{FileId, MigrationStatus};

    use crate::jobs::testing::{Fixture, settings, source_file};
    use crate::mover::ScriptedMover;

    fn failed_record(id: i64, retry_count: u32) -> MigrationFile {
        let mut record = MigrationFile::failed(&source_file(id), Utc::now());
        record.retry_count = retry_count;
        record.last_attempt_at = None;
        record
    }

    fn job(fixture: &Fixture, mover: ScriptedMover) -> RetryJob {
        RetryJob::new(settings(), fixture.files.clone(), Arc::new(mover))
    }

    #[tokio::test]
    async fn success_keeps_count_and_failure_increments_it() {
        let fixture = Fixture::new([], 10);
        fixture.files.insert(failed_record(1, 2));
        fixture.files.insert(failed_record(2, 2));
        let mut backoff = BackoffCounter::from_secs(&[30]);
        backoff.increment();

        let decision = job(&fixture, ScriptedMover::failing([2])).process(&mut backoff).await;
        assert_eq!(decision, Reschedule::Default);
        assert!(!backoff.is_active());

        let recovered = fixture.files.get(FileId::new(1)).unwrap();
        assert_eq!(recovered.status, MigrationStatus::Success);
        assert_eq!(recovered.retry_count, 2);
        assert!(recovered.new_uri.is_some());

        let exhausted = fixture.files.get(FileId::new(2)).unwrap();
        assert_eq!(exhausted.status, MigrationStatus::Fail);
        assert_eq!(exhausted.retry_count, 3);
        assert!(exhausted.new_uri.is_none());
    }

    #[tokio::test]
    async fn exhausted_records_are_never_claimed_again() {
        let fixture = Fixture::new([], 10);
        fixture.files.insert(failed_record(2, 2));
        let mut retry = job(&fixture, ScriptedMover::failing([2]));
        let mut backoff = BackoffCounter::from_secs(&[30]);

        retry.process(&mut backoff).await;
        assert_eq!(fixture.files.get(FileId::new(2)).unwrap().retry_count, 3);

        retry.process(&mut backoff).await;
        let record = fixture.files.get(FileId::new(2)).unwrap();
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.status, MigrationStatus::Fail);
        assert_eq!(backoff.count(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_retries_in_five_minutes() {
        let fixture = Fixture::new([], 10);
        fixture.files.set_unavailable(true);

        let decision = job(&fixture, ScriptedMover::default())
            .process(&mut BackoffCounter::from_secs(&[30]))
            .await;
        assert_eq!(decision, Reschedule::After(FAILURE_RETRY_DELAY));
    }
}
