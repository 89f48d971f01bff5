//! Seam to the system that physically relocates a file.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use migrator_core::{FileId, SourceFile};

/// The mover rejected a single file. Recorded on that file only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to move file {file_id}: {reason}")]
pub struct MoveError {
    pub file_id: FileId,
    pub reason: String,
}

impl MoveError {
    pub fn new(file_id: FileId, reason: impl Into<String>) -> Self {
        Self {
            file_id,
            reason: reason.into(),
        }
    }
}

/// Copies a source file to its new home and returns the new location.
#[async_trait]
pub trait FileMover: Send + Sync {
    async fn relocate(&self, file: &SourceFile) -> Result<String, MoveError>;
}

/// Stand-in mover: fails a fixed share of moves at random and otherwise
/// "moves" the file to `<target_prefix><uuid>`.
#[derive(Debug, Clone)]
pub struct StubFileMover {
    failure_percent: u32,
    target_prefix: String,
}

impl StubFileMover {
    pub fn new(failure_percent: u32, target_prefix: impl Into<String>) -> Self {
        Self {
            failure_percent: failure_percent.min(100),
            target_prefix: target_prefix.into(),
        }
    }
}

impl Default for StubFileMover {
    fn default() -> Self {
        Self::new(5, "s3://migration-target/")
    }
}

#[async_trait]
impl FileMover for StubFileMover {
    async fn relocate(&self, file: &SourceFile) -> Result<String, MoveError> {
        let roll = Uuid::new_v4().as_u128() % 100;
        if roll < u128::from(self.failure_percent) {
            return Err(MoveError::new(file.id, "simulated transfer failure"));
        }
        Ok(format!("{}{}", self.target_prefix, Uuid::new_v4()))
    }
}

/// Mover double that fails exactly the listed ids and counts every call.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedMover {
    failing: std::collections::HashSet<FileId>,
    moves: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl ScriptedMover {
    pub(crate) fn failing(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            failing: ids.into_iter().map(FileId::new).collect(),
            ..Self::default()
        }
    }

    /// Shared counter of `relocate` calls, readable after the mover is moved
    /// into a job.
    pub(crate) fn moves(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.moves.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl FileMover for ScriptedMover {
    async fn relocate(&self, file: &SourceFile) -> Result<String, MoveError> {
        self.moves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.failing.contains(&file.id) {
            return Err(MoveError::new(file.id, "scripted failure"));
        }
        Ok(format!("s3://test-bucket/{}", file.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file(id: i64) -> SourceFile {
        SourceFile {
            id: FileId::new(id),
            name: format!("doc-{id}"),
            uri: format!("nfs://legacy/{id}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stub_never_fails_at_zero_percent() {
        let mover = StubFileMover::new(0, "s3://bucket/");
        for id in 1..=50 {
            let uri = mover.relocate(&file(id)).await.unwrap();
            assert!(uri.starts_with("s3://bucket/"));
        }
    }

    #[tokio::test]
    async fn stub_always_fails_at_hundred_percent() {
        let mover = StubFileMover::new(250, "s3://bucket/");
        let err = mover.relocate(&file(7)).await.unwrap_err();
        assert_eq!(err.file_id, FileId::new(7));
    }
}
