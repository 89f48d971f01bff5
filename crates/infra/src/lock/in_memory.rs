//! In-memory lock for tests/dev.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with a paused clock
//! can advance past a TTL deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DistributedLock, LockError, OwnerToken, ttl_secs};

#[derive(Debug, Clone, Copy)]
struct Entry {
    owner: OwnerToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryLock {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the coordination store going away (every call errors).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current live holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<OwnerToken> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.owner)
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Connection("in-memory lock marked unavailable".into()));
        }
        Ok(())
    }

    fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if Self::live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                owner: *owner,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs(ttl)),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let held = Self::live_entry(&mut entries, key).is_some_and(|e| e.owner == *owner);
        if held {
            entries.remove(key);
        }
        Ok(held)
    }

    async fn renew(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match Self::live_entry(&mut entries, key) {
            Some(entry) if entry.owner == *owner => {
                entry.expires_at = Instant::now() + Duration::from_secs(ttl_secs(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
