use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::backend::LockBackend;
use crate::error::{LockError, Result};
use crate::options::LockOptions;

/// Runs critical sections under a named lease.
///
/// Construct one per process with the backend it should coordinate through
/// and share it by reference (or clone; clones share the backend).
pub struct LeaseKeeper<B> {
    backend: Arc<B>,
}

impl<B> Clone for LeaseKeeper<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: LockBackend + 'static> LeaseKeeper<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// [`lock`](Self::lock) with [`LockOptions::default`].
    pub async fn lock_with_default<F, Fut, T>(&self, name: &str, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock(name, LockOptions::default(), critical).await
    }

    /// Acquire the lease for `name`, run `critical` with at most `opts.ttl`
    /// to finish, then release the lease.
    ///
    /// The lease is released on every exit path: normal completion, the
    /// deadline firing (the section's future is dropped and
    /// [`LockError::Timeout`] returned), a panic inside the section, or the
    /// caller dropping this future. A panic is resumed only after the release
    /// has finished. Fails with [`LockError::UnableToLock`] if every create
    /// attempt finds the lease held.
    pub async fn lock<F, Fut, T>(&self, name: &str, opts: LockOptions, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        opts.validate()?;
        self.reclaim_expired(name, &opts).await;

        if !self.backend.create(name, &opts).await? {
            debug!(lease = name, attempts = opts.attempts, "unable to acquire lease");
            return Err(LockError::UnableToLock {
                name: name.to_string(),
                attempts: opts.attempts,
            });
        }
        debug!(lease = name, ttl = ?opts.ttl, "acquired lease");

        let guard = LeaseGuard::new(Arc::clone(&self.backend), name, &opts);
        let section = AssertUnwindSafe(async move { critical().await }).catch_unwind();
        let outcome = tokio::time::timeout(opts.ttl, section).await;
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(Err(panic)), released) => {
                if let Err(err) = released {
                    warn!(lease = name, error = %err, "failed to release lease after panic");
                }
                std::panic::resume_unwind(panic)
            }
            (Ok(Ok(value)), Ok(())) => Ok(value),
            (Ok(Ok(_)), Err(err)) => Err(LockError::Release {
                name: name.to_string(),
                source: Box::new(err),
            }),
            (Err(_), released) => {
                if let Err(err) = released {
                    warn!(lease = name, error = %err, "failed to release lease after timeout");
                }
                warn!(lease = name, ttl = ?opts.ttl, "critical section timed out");
                Err(LockError::Timeout {
                    name: name.to_string(),
                    ttl: opts.ttl,
                })
            }
        }
    }

    // Stale leases only exist on backends without holder-scoped locks. This
    // is a courtesy to other acquirers; the conditional create stays the
    // only thing that decides who holds the lease.
    async fn reclaim_expired(&self, name: &str, opts: &LockOptions) {
        match self.backend.expired(name, opts.ttl).await {
            Ok(true) => match self.backend.delete(name, opts).await {
                Ok(()) => info!(lease = name, "deleted expired lease"),
                Err(err) => warn!(lease = name, error = %err, "failed to delete expired lease"),
            },
            Ok(false) => {}
            Err(err) => warn!(lease = name, error = %err, "failed to check lease expiry"),
        }
    }
}

/// Scope guard for an acquired lease.
///
/// [`release`](Self::release) deletes the lease exactly once. A guard dropped
/// without releasing (the caller cancelled `lock`) spawns the delete on the
/// current tokio runtime.
struct LeaseGuard<B: LockBackend + 'static> {
    backend: Arc<B>,
    name: String,
    opts: LockOptions,
    released: bool,
}

impl<B: LockBackend + 'static> LeaseGuard<B> {
    fn new(backend: Arc<B>, name: &str, opts: &LockOptions) -> Self {
        Self {
            backend,
            name: name.to_string(),
            opts: opts.clone(),
            released: false,
        }
    }

    // The delete runs on its own task so a caller dropping `lock` mid-release
    // cannot abort it halfway.
    async fn release(mut self) -> Result<()> {
        self.released = true;
        let backend = Arc::clone(&self.backend);
        let name = self.name.clone();
        let opts = self.opts.clone();
        let delete = tokio::spawn(async move { backend.delete(&name, &opts).await });
        match delete.await {
            Ok(result) => {
                if result.is_ok() {
                    debug!(lease = %self.name, "released lease");
                }
                result
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(LockError::Runtime(format!("release task did not finish: {err}"))),
        }
    }
}

impl<B: LockBackend + 'static> Drop for LeaseGuard<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let name = std::mem::take(&mut self.name);
        let opts = self.opts.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match backend.delete(&name, &opts).await {
                        Ok(()) => debug!(lease = %name, "released abandoned lease"),
                        Err(err) => {
                            warn!(lease = %name, error = %err, "failed to release abandoned lease")
                        }
                    }
                });
            }
            Err(_) => warn!(
                lease = %name,
                "no tokio runtime to release abandoned lease; it stays until it expires"
            ),
        }
    }
}
