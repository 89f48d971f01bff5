//! Cross-process mutual exclusion backed by a TTL'd key in the coordination
//! store.
//!
//! ## Contract
//!
//! - `acquire` sets `key = owner` only if the key is absent, with an expiry.
//! - `release` deletes the key only if it still holds `owner`, as a single
//!   atomic check-and-delete.
//! - `renew` extends the expiry only if the key still holds `owner`.
//!
//! The TTL is the only recovery path for a crashed owner. A transport error is
//! reported as [`LockError`]; callers treat it exactly like a lost race and
//! skip the guarded section.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLock;
#[cfg(feature = "redis")]
pub use redis::RedisLock;

/// Opaque owner token stored as the lock value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Fresh random token (one per execution, or one per process for
    /// leadership).
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordination store failure.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("coordination store unreachable: {0}")]
    Connection(String),

    #[error("coordination store command failed: {0}")]
    Command(String),
}

/// Distributed lock primitive.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `true` iff this call established ownership of `key`.
    async fn acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError>;

    /// Returns `true` iff the key was held by `owner` and has been deleted.
    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError>;

    /// Returns `true` iff the key was held by `owner` and its expiry was reset
    /// to `ttl`.
    async fn renew(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError>;
}

/// Whole seconds for the store's expiry argument; never zero.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_rounded_down_but_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(1_900)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(1_800)), 1_800);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(OwnerToken::new(), OwnerToken::new());
    }
}
