//! In-memory stores for tests/dev.
//!
//! Each store can be flipped "unavailable" to exercise the connectivity
//! failure paths of the jobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use migrator_core::{
    Entity, FileId, IdSpan, MigrationFile, MigrationRange, MigrationStatus, RangeId, RangeStatus,
    SourceFile, expansion_span, plan_ranges, retention_cutoff,
};

use super::{
    DEFAULT_STALE_AFTER, MigrationFileStore, RangeStore, RetryPolicy, SeedPolicy, SourceFileReader,
    StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct Availability(AtomicBool);

impl Availability {
    fn set_unavailable(&self, unavailable: bool) {
        self.0.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> StoreResult<()> {
        if self.0.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("{store} marked unavailable")));
        }
        Ok(())
    }
}

/// In-memory source table.
#[derive(Debug, Default)]
pub struct InMemorySourceFiles {
    files: RwLock<BTreeMap<FileId, SourceFile>>,
    availability: Availability,
}

impl InMemorySourceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, file: SourceFile) {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(file.id, file);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.availability.set_unavailable(unavailable);
    }

    /// `(min, max)` id of files created at or after `cutoff`.
    fn bounds_since(&self, cutoff: DateTime<Utc>) -> Option<(i64, i64)> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids = files
            .values()
            .filter(|f| f.created_at >= cutoff)
            .map(|f| f.id.get());
        let first = ids.next()?;
        Some(ids.fold((first, first), |(lo, hi), id| (lo.min(id), hi.max(id))))
    }

    fn max_id_after(&self, id: i64) -> Option<i64> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .keys()
            .next_back()
            .map(|k| k.get())
            .filter(|max| *max > id)
    }
}

#[async_trait]
impl SourceFileReader for InMemorySourceFiles {
    async fn fetch(&self, span: IdSpan) -> StoreResult<Vec<SourceFile>> {
        self.availability.check("source files")?;
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files
            .range(FileId::new(span.min)..=FileId::new(span.max))
            .map(|(_, f)| f.clone())
            .collect())
    }
}

/// In-memory migration record table.
#[derive(Debug, Default)]
pub struct InMemoryMigrationFiles {
    records: Mutex<HashMap<FileId, MigrationFile>>,
    policy: RetryPolicy,
    availability: Availability,
    fail_writes: AtomicBool,
}

impl InMemoryMigrationFiles {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn insert(&self, record: MigrationFile) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.id(), record);
    }

    pub fn get(&self, id: FileId) -> Option<MigrationFile> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&id).cloned()
    }

    /// All records ordered by id.
    pub fn all(&self) -> Vec<MigrationFile> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.availability.set_unavailable(unavailable);
    }

    /// Make every batch write fail (and roll back) while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.availability.check("migration files")?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Query("batch write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationFileStore for InMemoryMigrationFiles {
    async fn upsert(&self, records: &[MigrationFile]) -> StoreResult<()> {
        self.check_writable()?;
        let mut table = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            table
                .entry(record.id())
                .and_modify(|existing| {
                    existing.new_uri = record.new_uri.clone();
                    existing.status = record.status;
                })
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    async fn upsert_retry_batch(&self, records: &[MigrationFile]) -> StoreResult<()> {
        self.check_writable()?;
        let now = Utc::now();
        let mut table = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            if let Some(existing) = table.get_mut(&record.id()) {
                existing.new_uri = record.new_uri.clone();
                existing.status = record.status;
                existing.retry_count = record.retry_count;
                existing.last_attempt_at = Some(now);
            }
        }
        Ok(())
    }

    async fn claim_failures_for_retry(&self) -> StoreResult<Vec<MigrationFile>> {
        self.availability.check("migration files")?;
        let now = Utc::now();
        let mut table = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let mut candidates: Vec<_> = table
            .values()
            .filter(|r| r.is_retryable(self.policy.max_retries))
            .map(|r| (r.last_attempt_at, r.id))
            .collect();
        // Never-attempted first, then oldest attempt.
        candidates.sort();
        candidates.truncate(self.policy.batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = table.get_mut(&id) {
                record.status = MigrationStatus::Retrying;
                record.last_attempt_at = Some(now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }
}

#[derive(Debug, Default)]
struct RangeTable {
    ranges: BTreeMap<RangeId, MigrationRange>,
    next_id: i64,
}

impl RangeTable {
    fn push(&mut self, span: IdSpan, status: RangeStatus, last_updated: DateTime<Utc>) -> RangeId {
        self.next_id += 1;
        let id = RangeId::new(self.next_id);
        self.ranges.insert(
            id,
            MigrationRange {
                id,
                span,
                status,
                last_updated,
            },
        );
        id
    }

    fn max_covered(&self) -> Option<i64> {
        self.ranges.values().map(|r| r.span.max).max()
    }
}

/// In-memory range table seeded from an [`InMemorySourceFiles`].
#[derive(Debug)]
pub struct InMemoryRangeStore {
    table: Mutex<RangeTable>,
    source: Arc<InMemorySourceFiles>,
    policy: SeedPolicy,
    stale_after: Duration,
    availability: Availability,
}

impl InMemoryRangeStore {
    pub fn new(source: Arc<InMemorySourceFiles>, policy: SeedPolicy) -> Self {
        Self {
            table: Mutex::new(RangeTable::default()),
            source,
            policy,
            stale_after: DEFAULT_STALE_AFTER,
            availability: Availability::default(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Insert a row directly (fixtures).
    pub fn insert_range(
        &self,
        span: IdSpan,
        status: RangeStatus,
        last_updated: DateTime<Utc>,
    ) -> RangeId {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.push(span, status, last_updated)
    }

    pub fn get(&self, range_id: RangeId) -> Option<MigrationRange> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.ranges.get(&range_id).cloned()
    }

    /// All ranges ordered by id.
    pub fn ranges(&self) -> Vec<MigrationRange> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.ranges.values().cloned().collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.availability.set_unavailable(unavailable);
    }
}

#[async_trait]
impl RangeStore for InMemoryRangeStore {
    async fn set_status(&self, range_id: RangeId, status: RangeStatus) -> StoreResult<()> {
        self.availability.check("ranges")?;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(range) = table.ranges.get_mut(&range_id) {
            range.status = status;
            range.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn claim_next_pending(&self) -> StoreResult<Option<MigrationRange>> {
        self.availability.check("ranges")?;
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(table
            .ranges
            .values()
            .find(|r| r.status == RangeStatus::Pending)
            .cloned())
    }

    async fn start_processing(&self, range_id: RangeId) -> StoreResult<bool> {
        self.availability.check("ranges")?;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match table.ranges.get_mut(&range_id) {
            Some(range) if range.status == RangeStatus::Pending => {
                range.status = RangeStatus::Processing;
                range.last_updated = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn seed(&self, init: bool) -> StoreResult<usize> {
        self.availability.check("ranges")?;
        let now = Utc::now();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let spans = if init {
            let cutoff = retention_cutoff(now, self.policy.retention_minutes);
            match self.source.bounds_since(cutoff) {
                Some((min, max)) => plan_ranges(min, max, self.policy.batch_size),
                None => Vec::new(),
            }
        } else {
            let Some(current_max) = table.max_covered() else {
                return Ok(0);
            };
            match expansion_span(current_max, self.source.max_id_after(current_max)) {
                Some(span) => plan_ranges(span.min, span.max, self.policy.batch_size),
                None => Vec::new(),
            }
        };

        for span in &spans {
            table.push(*span, RangeStatus::Pending, now);
        }
        Ok(spans.len())
    }

    async fn is_seeded(&self) -> StoreResult<bool> {
        self.availability.check("ranges")?;
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(!table.ranges.is_empty())
    }

    async fn reclaim_stale(&self) -> StoreResult<u64> {
        self.availability.check("ranges")?;
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| StoreError::Query(format!("stale threshold out of range: {e}")))?;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let mut reclaimed = 0;
        for range in table.ranges.values_mut().filter(|r| r.is_stale(now, threshold)) {
            range.status = RangeStatus::Pending;
            range.last_updated = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
