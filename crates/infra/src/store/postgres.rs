//! Postgres-backed stores.
//!
//! Table layout lives in `sql/schema.sql`. Every multi-row write runs in a
//! single transaction so a batch is either fully applied or not at all.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Io / Tls / PoolTimedOut / PoolClosed | `Connection` |
//! | ColumnDecode / Decode / ColumnNotFound | `Decode` |
//! | Database / other | `Query` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use migrator_core::{
    DomainError, FileId, IdSpan, MigrationFile, MigrationRange, MigrationStatus, RangeId,
    RangeStatus, SourceFile, expansion_span, plan_ranges, retention_cutoff,
};

use super::{
    DEFAULT_STALE_AFTER, MigrationFileStore, RangeStore, RetryPolicy, SeedPolicy, SourceFileReader,
    StoreError, StoreResult,
};

/// Reads `source_files`.
#[derive(Debug, Clone)]
pub struct PostgresSourceFiles {
    pool: Arc<PgPool>,
}

impl PostgresSourceFiles {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceFileReader for PostgresSourceFiles {
    #[instrument(skip(self), fields(min_id = span.min, max_id = span.max, file_count), err)]
    async fn fetch(&self, span: IdSpan) -> StoreResult<Vec<SourceFile>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, file_name, file_uri, create_date
            FROM source_files
            WHERE file_id BETWEEN $1 AND $2
            ORDER BY file_id
            "#,
        )
        .bind(span.min)
        .bind(span.max)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_source_files", e))?;

        let mut files = Vec::with_capacity(rows.len());
        for row in rows {
            let file = SourceFileRow::from_row(&row)
                .map_err(|e| StoreError::Decode(format!("source_files row: {e}")))?;
            files.push(file.into());
        }

        Span::current().record("file_count", files.len());
        Ok(files)
    }
}

/// Owns `migration_files`.
#[derive(Debug, Clone)]
pub struct PostgresMigrationFiles {
    pool: Arc<PgPool>,
    policy: RetryPolicy,
}

impl PostgresMigrationFiles {
    pub fn new(pool: Arc<PgPool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl MigrationFileStore for PostgresMigrationFiles {
    #[instrument(skip(self, records), fields(record_count = records.len()), err)]
    async fn upsert(&self, records: &[MigrationFile]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO migration_files (
                    file_id,
                    old_uri,
                    new_uri,
                    file_name,
                    create_date,
                    status,
                    migration_date,
                    last_attempt_date
                )
                VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7)
                ON CONFLICT (file_id)
                DO UPDATE SET
                    new_uri = EXCLUDED.new_uri,
                    status = EXCLUDED.status
                "#,
            )
            .bind(record.id.get())
            .bind(&record.old_uri)
            .bind(record.new_uri.as_deref())
            .bind(&record.file_name)
            .bind(record.created_at)
            .bind(record.status.as_str())
            .bind(record.last_attempt_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_migration_file", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, records), fields(record_count = records.len()), err)]
    async fn upsert_retry_batch(&self, records: &[MigrationFile]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                UPDATE migration_files
                SET new_uri = $1,
                    status = $2,
                    retry_count = $3,
                    last_attempt_date = NOW()
                WHERE file_id = $4
                "#,
            )
            .bind(record.new_uri.as_deref())
            .bind(record.status.as_str())
            .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
            .bind(record.id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_retried_file", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(
        skip(self),
        fields(
            batch_size = self.policy.batch_size,
            max_retries = self.policy.max_retries,
            claimed
        ),
        err
    )]
    async fn claim_failures_for_retry(&self) -> StoreResult<Vec<MigrationFile>> {
        // Row locks with SKIP LOCKED keep concurrent claimers disjoint.
        let rows = sqlx::query(
            r#"
            WITH retries AS (
                SELECT file_id
                FROM migration_files
                WHERE status = 'FAIL' AND retry_count < $1
                ORDER BY last_attempt_date NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE migration_files
            SET status = 'RETRYING',
                last_attempt_date = NOW()
            FROM retries
            WHERE migration_files.file_id = retries.file_id
            RETURNING
                migration_files.file_id,
                migration_files.old_uri,
                migration_files.new_uri,
                migration_files.file_name,
                migration_files.create_date,
                migration_files.status,
                migration_files.retry_count,
                migration_files.last_attempt_date
            "#,
        )
        .bind(i32::try_from(self.policy.max_retries).unwrap_or(i32::MAX))
        .bind(i64::from(self.policy.batch_size))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_failures_for_retry", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let record = MigrationFileRow::from_row(&row)
                .map_err(|e| StoreError::Decode(format!("migration_files row: {e}")))?;
            claimed.push(MigrationFile::try_from(record)?);
        }

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }
}

/// Owns `migration_ranges`; seeds from `source_files`.
#[derive(Debug, Clone)]
pub struct PostgresRangeStore {
    pool: Arc<PgPool>,
    policy: SeedPolicy,
    stale_after: Duration,
}

impl PostgresRangeStore {
    pub fn new(pool: Arc<PgPool>, policy: SeedPolicy) -> Self {
        Self {
            pool,
            policy,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn initial_spans(&self, tx: &mut Transaction<'_, Postgres>) -> StoreResult<Vec<IdSpan>> {
        let cutoff = retention_cutoff(Utc::now(), self.policy.retention_minutes);
        let row = sqlx::query(
            r#"
            SELECT MIN(file_id) AS min_id, MAX(file_id) AS max_id
            FROM source_files
            WHERE create_date >= $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("source_bounds", e))?;

        let min: Option<i64> = row
            .try_get("min_id")
            .map_err(|e| StoreError::Decode(format!("min_id: {e}")))?;
        let max: Option<i64> = row
            .try_get("max_id")
            .map_err(|e| StoreError::Decode(format!("max_id: {e}")))?;

        Ok(match (min, max) {
            (Some(min), Some(max)) => plan_ranges(min, max, self.policy.batch_size),
            _ => Vec::new(),
        })
    }

    async fn expansion_spans(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> StoreResult<Vec<IdSpan>> {
        let current_max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(max_id) FROM migration_ranges")
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("max_covered_id", e))?;
        let Some(current_max) = current_max else {
            return Ok(Vec::new());
        };

        let next_max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(file_id) FROM source_files WHERE file_id > $1")
                .bind(current_max)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("next_source_max", e))?;

        Ok(match expansion_span(current_max, next_max) {
            Some(span) => plan_ranges(span.min, span.max, self.policy.batch_size),
            None => Vec::new(),
        })
    }
}

#[async_trait]
impl RangeStore for PostgresRangeStore {
    #[instrument(skip(self), fields(range_id = %range_id, status = %status), err)]
    async fn set_status(&self, range_id: RangeId, status: RangeStatus) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE migration_ranges
            SET status = $1, last_updated = NOW()
            WHERE range_id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(range_id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_range_status", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_next_pending(&self) -> StoreResult<Option<MigrationRange>> {
        let row = sqlx::query(
            r#"
            SELECT range_id, min_id, max_id, status, last_updated
            FROM migration_ranges
            WHERE status = 'PENDING'
            ORDER BY range_id
            LIMIT 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next_pending", e))?;

        match row {
            Some(row) => {
                let range = RangeRow::from_row(&row)
                    .map_err(|e| StoreError::Decode(format!("migration_ranges row: {e}")))?;
                Ok(Some(MigrationRange::try_from(range)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(range_id = %range_id), err)]
    async fn start_processing(&self, range_id: RangeId) -> StoreResult<bool> {
        // Compare-and-set: only one caller can move a row out of PENDING.
        let result = sqlx::query(
            r#"
            UPDATE migration_ranges
            SET status = 'PROCESSING', last_updated = NOW()
            WHERE range_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(range_id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("start_range_processing", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(created), err)]
    async fn seed(&self, init: bool) -> StoreResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let spans = if init {
            self.initial_spans(&mut tx).await?
        } else {
            self.expansion_spans(&mut tx).await?
        };

        if !spans.is_empty() {
            let mins: Vec<i64> = spans.iter().map(|s| s.min).collect();
            let maxes: Vec<i64> = spans.iter().map(|s| s.max).collect();
            sqlx::query(
                r#"
                INSERT INTO migration_ranges (min_id, max_id)
                SELECT * FROM UNNEST($1::bigint[], $2::bigint[])
                "#,
            )
            .bind(&mins)
            .bind(&maxes)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_ranges", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("created", spans.len());
        Ok(spans.len())
    }

    #[instrument(skip(self), err)]
    async fn is_seeded(&self) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM migration_ranges)")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_seeded", e))
    }

    #[instrument(skip(self), fields(stale_after_secs = self.stale_after.as_secs()), err)]
    async fn reclaim_stale(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE migration_ranges
            SET status = 'PENDING', last_updated = NOW()
            WHERE status = 'PROCESSING'
              AND last_updated < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(self.stale_after.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_ranges", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::Connection(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => StoreError::Decode(format!("{operation}: {err}")),
        sqlx::Error::Database(db_err) => StoreError::Query(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        _ => StoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct SourceFileRow {
    file_id: i64,
    file_name: String,
    file_uri: String,
    create_date: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SourceFileRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SourceFileRow {
            file_id: row.try_get("file_id")?,
            file_name: row.try_get("file_name")?,
            file_uri: row.try_get("file_uri")?,
            create_date: row.try_get("create_date")?,
        })
    }
}

impl From<SourceFileRow> for SourceFile {
    fn from(row: SourceFileRow) -> Self {
        SourceFile {
            id: FileId::new(row.file_id),
            name: row.file_name,
            uri: row.file_uri,
            created_at: row.create_date,
        }
    }
}

#[derive(Debug)]
struct MigrationFileRow {
    file_id: i64,
    old_uri: String,
    new_uri: Option<String>,
    file_name: String,
    create_date: DateTime<Utc>,
    status: String,
    retry_count: i32,
    last_attempt_date: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MigrationFileRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MigrationFileRow {
            file_id: row.try_get("file_id")?,
            old_uri: row.try_get("old_uri")?,
            new_uri: row.try_get("new_uri")?,
            file_name: row.try_get("file_name")?,
            create_date: row.try_get("create_date")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            last_attempt_date: row.try_get("last_attempt_date")?,
        })
    }
}

impl TryFrom<MigrationFileRow> for MigrationFile {
    type Error = DomainError;

    fn try_from(row: MigrationFileRow) -> Result<Self, Self::Error> {
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            DomainError::invariant(format!(
                "negative retry_count {} for file {}",
                row.retry_count, row.file_id
            ))
        })?;
        Ok(MigrationFile {
            id: FileId::new(row.file_id),
            old_uri: row.old_uri,
            new_uri: row.new_uri,
            file_name: row.file_name,
            created_at: row.create_date,
            status: row.status.parse::<MigrationStatus>()?,
            retry_count,
            last_attempt_at: row.last_attempt_date,
        })
    }
}

#[derive(Debug)]
struct RangeRow {
    range_id: i64,
    min_id: i64,
    max_id: i64,
    status: String,
    last_updated: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RangeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RangeRow {
            range_id: row.try_get("range_id")?,
            min_id: row.try_get("min_id")?,
            max_id: row.try_get("max_id")?,
            status: row.try_get("status")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

impl TryFrom<RangeRow> for MigrationRange {
    type Error = DomainError;

    fn try_from(row: RangeRow) -> Result<Self, Self::Error> {
        Ok(MigrationRange {
            id: RangeId::new(row.range_id),
            span: IdSpan::new(row.min_id, row.max_id)?,
            status: row.status.parse()?,
            last_updated: row.last_updated,
        })
    }
}
