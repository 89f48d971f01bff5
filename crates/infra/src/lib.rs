//! Infrastructure layer: configuration, coordination, persistence, jobs.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod mover;
pub mod scheduler;
pub mod store;

pub use config::{ConfigError, Properties, Settings};
pub use jobs::{Collaborators, JobPools, ShutdownSignal, ShutdownTrigger};
pub use lock::{DistributedLock, LockError, OwnerToken};
pub use mover::{FileMover, MoveError, StubFileMover};
pub use scheduler::GlobalScheduler;
pub use store::{MigrationFileStore, RangeStore, SourceFileReader, StoreError};
