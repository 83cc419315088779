//! Lease storage backends.
//!
//! A backend owns the store-specific half of the locking protocol: an atomic
//! create that succeeds for exactly one contender, an unconditional delete,
//! and optionally an expiry check for stores whose leases outlive their
//! holder. The coordinator only ever talks to [`LockBackend`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::options::LockOptions;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoLockBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::AdvisoryLockBackend;

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to create the lease for `name`, retrying up to `opts.attempts`
    /// times with the backend's retry shape.
    ///
    /// Returns `Ok(false)` when every attempt found the lease held elsewhere.
    async fn create(&self, name: &str, opts: &LockOptions) -> Result<bool>;

    /// Remove the lease for `name` unconditionally.
    async fn delete(&self, name: &str, opts: &LockOptions) -> Result<()>;

    /// Whether a lease for `name` exists but is older than `ttl`.
    ///
    /// Backends whose leases cannot outlive their holder keep the default.
    async fn expired(&self, _name: &str, _ttl: Duration) -> Result<bool> {
        Ok(false)
    }
}
