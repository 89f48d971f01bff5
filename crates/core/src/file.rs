//! File records: the read-only source snapshot and the migration record
//! this subsystem owns.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::FileId;

/// Immutable snapshot of a file row in the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: FileId,
    pub name: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the latest transfer attempt for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Success,
    Fail,
    Retrying,
}

impl MigrationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Success => "SUCCESS",
            MigrationStatus::Fail => "FAIL",
            MigrationStatus::Retrying => "RETRYING",
        }
    }
}

impl core::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(MigrationStatus::Success),
            "FAIL" => Ok(MigrationStatus::Fail),
            "RETRYING" => Ok(MigrationStatus::Retrying),
            other => Err(DomainError::unknown_status("migration", other)),
        }
    }
}

/// Persisted migration state of a single file.
///
/// Written once by the migration job (`succeeded` / `failed`) and afterwards
/// only through the retry transitions, which never decrease `retry_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFile {
    pub id: FileId,
    pub old_uri: String,
    /// Set once the payload has been moved.
    pub new_uri: Option<String>,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub status: MigrationStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl MigrationFile {
    /// First-attempt record for a file the mover relocated.
    pub fn succeeded(source: &SourceFile, new_uri: String, attempted_at: DateTime<Utc>) -> Self {
        Self::first_attempt(source, Some(new_uri), MigrationStatus::Success, attempted_at)
    }

    /// First-attempt record for a file the mover rejected.
    pub fn failed(source: &SourceFile, attempted_at: DateTime<Utc>) -> Self {
        Self::first_attempt(source, None, MigrationStatus::Fail, attempted_at)
    }

    fn first_attempt(
        source: &SourceFile,
        new_uri: Option<String>,
        status: MigrationStatus,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: source.id,
            old_uri: source.uri.clone(),
            new_uri,
            file_name: source.name.clone(),
            created_at: source.created_at,
            status,
            retry_count: 0,
            last_attempt_at: Some(attempted_at),
        }
    }

    /// Rebuild the source snapshot the mover needs for a retry.
    pub fn to_source(&self) -> SourceFile {
        SourceFile {
            id: self.id,
            name: self.file_name.clone(),
            uri: self.old_uri.clone(),
            created_at: self.created_at,
        }
    }

    /// Retry succeeded: retry count is preserved.
    pub fn retry_succeeded(&self, new_uri: String, attempted_at: DateTime<Utc>) -> Self {
        Self {
            new_uri: Some(new_uri),
            status: MigrationStatus::Success,
            last_attempt_at: Some(attempted_at),
            ..self.clone()
        }
    }

    /// Retry failed again: one more attempt is counted.
    pub fn retry_failed(&self, attempted_at: DateTime<Utc>) -> Self {
        Self {
            status: MigrationStatus::Fail,
            retry_count: self.retry_count.saturating_add(1),
            last_attempt_at: Some(attempted_at),
            ..self.clone()
        }
    }

    /// Whether a failed record may still be claimed for another retry.
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        self.status == MigrationStatus::Fail && self.retry_count < max_retries
    }
}

impl Entity for MigrationFile {
    type Id = FileId;

    fn id(&self) -> FileId {
        self.id
    }
}
