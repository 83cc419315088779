use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::LockBackend;
use crate::error::{LockError, Result};
use crate::options::LockOptions;
use crate::retry::RetryPolicy;

/// Process-local conditional-write store.
///
/// Behaves like the DynamoDB backend (create-if-absent, timestamped leases,
/// lazy expiry) without any network. Useful for tests and for coordinating
/// tasks inside a single process.
#[derive(Default)]
pub struct MemoryBackend {
    leases: Mutex<HashMap<String, Instant>>,
    create_attempts: AtomicU32,
    deletes: AtomicU32,
    always_contended: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create attempt fail its conditional check.
    pub fn set_always_contended(&self, contended: bool) {
        self.always_contended.store(contended, Ordering::SeqCst);
    }

    /// Insert a lease as if another process had created it `age` ago.
    pub fn insert_with_age(&self, name: &str, age: Duration) -> Result<()> {
        let created = Instant::now()
            .checked_sub(age)
            .ok_or_else(|| LockError::InvalidOptions(format!("lease age {age:?} too large")))?;
        self.lock_leases()?.insert(name.to_string(), created);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_leases()
            .map(|leases| leases.contains_key(name))
            .unwrap_or(false)
    }

    pub fn create_attempts(&self) -> u32 {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn lock_leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Instant>>> {
        self.leases
            .lock()
            .map_err(|e| LockError::Pool(format!("memory backend mutex poisoned: {e}")))
    }

    fn put_if_absent(&self, name: &str) -> Result<bool> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_contended.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut leases = self.lock_leases()?;
        if leases.contains_key(name) {
            return Ok(false);
        }
        leases.insert(name.to_string(), Instant::now());
        Ok(true)
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn create(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        RetryPolicy::immediate(opts.attempts)
            .run(|_| async move { self.put_if_absent(name) })
            .await
    }

    async fn delete(&self, name: &str, _opts: &LockOptions) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let removed = self.lock_leases()?.remove(name);
        debug!(lease = name, existed = removed.is_some(), "deleted in-memory lease");
        Ok(())
    }

    async fn expired(&self, name: &str, ttl: Duration) -> Result<bool> {
        Ok(self
            .lock_leases()?
            .get(name)
            .is_some_and(|created| created.elapsed() > ttl))
    }
}
