//! Advisory-lock backend over PostgreSQL.
//!
//! Leases are `pg_try_advisory_lock(lock_space, key)` calls where `key` is
//! derived from the lease name. PostgreSQL enforces exclusivity per session
//! and drops the lock if the session dies, so there is no expiry to inspect.

mod adapter;
mod connect;

pub use adapter::{ConnectionAdapter, DirectConnectionAdapter, ErrorHandler, PooledConnectionAdapter};
pub use connect::{PgConnectOptions, PgSslMode};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::{debug, warn};

use super::LockBackend;
use crate::error::{LockError, Result};
use crate::key::{advisory_key, DEFAULT_LOCK_SPACE};
use crate::options::LockOptions;
use crate::retry::RetryPolicy;

const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1, $2)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1, $2)";

type Slot = (i32, i32);

// `None` marks an attempt in flight, `Some` the session holding the lock.
type Registry<C> = Arc<Mutex<HashMap<Slot, Option<C>>>>;

fn lock_registry<C>(
    held: &Mutex<HashMap<Slot, Option<C>>>,
) -> Result<MutexGuard<'_, HashMap<Slot, Option<C>>>> {
    held.lock()
        .map_err(|e| LockError::Pool(format!("advisory lock registry poisoned: {e}")))
}

fn free_slot<C>(held: &Mutex<HashMap<Slot, Option<C>>>, slot: Slot) {
    if let Ok(mut held) = lock_registry(held) {
        if matches!(held.get(&slot), Some(None)) {
            held.remove(&slot);
        }
    }
}

/// PostgreSQL advisory-lock driver.
///
/// Advisory locks are re-entrant within a session, so the driver also tracks
/// which slots this process holds: a second in-process contender for a held
/// slot fails its attempt instead of stacking the lock on a shared session.
pub struct AdvisoryLockBackend<A: ConnectionAdapter> {
    adapter: Arc<A>,
    default_lock_space: i32,
    held: Registry<A::Connection>,
}

impl<A: ConnectionAdapter> AdvisoryLockBackend<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter: Arc::new(adapter),
            default_lock_space: DEFAULT_LOCK_SPACE,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock space used when [`LockOptions::lock_space`] is unset.
    pub fn with_default_lock_space(mut self, lock_space: i32) -> Self {
        self.default_lock_space = lock_space;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The `(lock_space, key)` pair passed to PostgreSQL for `name`.
    pub fn lock_args(&self, name: &str, opts: &LockOptions) -> Slot {
        (
            opts.lock_space.unwrap_or(self.default_lock_space),
            advisory_key(name),
        )
    }

    fn reserve(&self, slot: Slot) -> Result<Option<Attempt<A>>> {
        let mut held = lock_registry(&self.held)?;
        if held.contains_key(&slot) {
            return Ok(None);
        }
        held.insert(slot, None);
        Ok(Some(Attempt {
            adapter: Arc::clone(&self.adapter),
            held: Arc::clone(&self.held),
            slot,
            pending: None,
            committed: false,
        }))
    }

    /// Remove the session holding `slot`, leaving in-flight attempts alone.
    fn take_held(&self, slot: Slot) -> Result<Option<A::Connection>> {
        let mut held = lock_registry(&self.held)?;
        match held.get(&slot) {
            Some(Some(_)) => Ok(held.remove(&slot).flatten()),
            _ => Ok(None),
        }
    }

    async fn try_lock_once(&self, name: &str, slot: Slot) -> Result<bool> {
        let Some(mut attempt) = self.reserve(slot)? else {
            debug!(lease = name, lock_space = slot.0, key = slot.1, "advisory lock held in this process");
            return Ok(false);
        };
        let conn = match self.adapter.checkout().await {
            Ok(conn) => conn,
            Err(err) => {
                self.adapter.report_error(&err);
                return Err(err);
            }
        };

        let session = attempt.pending.insert(conn);
        let locked = match try_lock(&**session, slot).await {
            Ok(locked) => locked,
            Err(err) => {
                // `attempt` undoes whatever the server may have granted
                self.adapter.report_error(&err);
                return Err(err);
            }
        };

        let (lock_space, key) = slot;
        if locked {
            debug!(lease = name, lock_space, key, "acquired PostgreSQL advisory lock");
            attempt.commit();
        } else {
            debug!(
                lease = name,
                lock_space,
                key,
                "PostgreSQL advisory lock already held by another session"
            );
            attempt.settle();
        }
        Ok(locked)
    }
}

async fn try_lock(client: &Client, slot: Slot) -> Result<bool> {
    let row = client.query_one(TRY_LOCK_SQL, &[&slot.0, &slot.1]).await?;
    Ok(row.try_get::<_, bool>(0)?)
}

async fn unlock(client: &Client, slot: Slot) -> Result<bool> {
    let row = client.query_one(UNLOCK_SQL, &[&slot.0, &slot.1]).await?;
    Ok(row.try_get::<_, bool>(0)?)
}

/// One lock attempt: the in-process claim on a slot plus the session the
/// try-lock was sent on.
///
/// Dropped before the outcome is known (cancelled mid-query, or the query
/// failed), the server may have granted the lock anyway. The session then
/// unlocks the slot on a spawned task and is discarded if that fails; the
/// slot stays claimed until this finishes.
struct Attempt<A: ConnectionAdapter> {
    adapter: Arc<A>,
    held: Registry<A::Connection>,
    slot: Slot,
    pending: Option<A::Connection>,
    committed: bool,
}

impl<A: ConnectionAdapter> Attempt<A> {
    fn commit(mut self) {
        let Some(conn) = self.pending.take() else {
            return;
        };
        match lock_registry(&self.held) {
            Ok(mut held) => {
                held.insert(self.slot, Some(conn));
                self.committed = true;
            }
            // untracked locks must not outlive this attempt
            Err(_) => self.adapter.discard(conn),
        }
    }

    /// The try-lock answered `false`; the session holds nothing new.
    fn settle(mut self) {
        self.pending = None;
    }
}

impl<A: ConnectionAdapter> Drop for Attempt<A> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let Some(conn) = self.pending.take() else {
            free_slot(&self.held, self.slot);
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.adapter.discard(conn);
            free_slot(&self.held, self.slot);
            return;
        };

        let adapter = Arc::clone(&self.adapter);
        let held = Arc::clone(&self.held);
        let slot = self.slot;
        handle.spawn(async move {
            let result = unlock(&conn, slot).await;
            match result {
                Ok(unlocked) => debug!(
                    lock_space = slot.0,
                    key = slot.1,
                    unlocked,
                    "undid abandoned advisory lock attempt"
                ),
                Err(err) => {
                    warn!(
                        lock_space = slot.0,
                        key = slot.1,
                        error = %err,
                        "failed to undo abandoned advisory lock attempt; discarding session"
                    );
                    adapter.discard(conn);
                }
            }
            free_slot(&held, slot);
        });
    }
}

#[async_trait]
impl<A: ConnectionAdapter> LockBackend for AdvisoryLockBackend<A> {
    async fn create(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        let slot = self.lock_args(name, opts);
        debug!(
            lease = name,
            lock_space = slot.0,
            key = slot.1,
            "attempting to acquire PostgreSQL advisory lock"
        );
        RetryPolicy::fixed(opts.attempts, opts.attempt_interval)
            .run(move |_| self.try_lock_once(name, slot))
            .await
    }

    async fn delete(&self, name: &str, opts: &LockOptions) -> Result<()> {
        let slot = self.lock_args(name, opts);
        let unlocked = match self.take_held(slot)? {
            Some(conn) if conn.is_closed() => {
                warn!(
                    lease = name,
                    lock_space = slot.0,
                    key = slot.1,
                    "session holding advisory lock is closed; lock was released with it"
                );
                return Ok(());
            }
            Some(conn) => {
                let result = unlock(&conn, slot).await;
                match result {
                    Ok(unlocked) => unlocked,
                    Err(err) => {
                        self.adapter.report_error(&err);
                        // the session may still hold the lock
                        self.adapter.discard(conn);
                        return Err(err);
                    }
                }
            }
            None => {
                self.adapter
                    .with_connection(move |conn| async move { unlock(&conn, slot).await })
                    .await?
            }
        };

        if unlocked {
            debug!(lease = name, lock_space = slot.0, key = slot.1, "released PostgreSQL advisory lock");
        } else {
            warn!(
                lease = name,
                lock_space = slot.0,
                key = slot.1,
                "advisory lock was not held by the releasing session"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> AdvisoryLockBackend<DirectConnectionAdapter> {
        AdvisoryLockBackend::new(DirectConnectionAdapter::from_url(
            "postgres://postgres@localhost/postgres",
        ))
    }

    #[test]
    fn lock_args_use_sentinel_space_by_default() {
        let args = backend().lock_args("job-42", &LockOptions::default());
        assert_eq!(args, (i32::MIN, advisory_key("job-42")));
    }

    #[test]
    fn lock_space_resolution_prefers_options_over_backend_default() {
        let backend = backend().with_default_lock_space(7);
        assert_eq!(backend.lock_args("a", &LockOptions::default()).0, 7);
        assert_eq!(
            backend.lock_args("a", &LockOptions::default().with_lock_space(9)).0,
            9
        );
    }

    #[test]
    fn reservations_are_exclusive_and_released_on_drop() -> Result<()> {
        let backend = backend();
        let slot = (1, 2);
        let first = backend.reserve(slot)?;
        assert!(first.is_some());
        assert!(backend.reserve(slot)?.is_none());
        drop(first);
        assert!(backend.reserve(slot)?.is_some());
        Ok(())
    }

    #[test]
    fn take_held_ignores_in_flight_reservations() -> Result<()> {
        let backend = backend();
        let slot = (1, 2);
        let _reservation = backend.reserve(slot)?;
        assert!(backend.take_held(slot)?.is_none());
        assert!(backend.reserve(slot)?.is_none());
        Ok(())
    }
}
