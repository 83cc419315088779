//! Cross-process named leases.
//!
//! Processes that share a store coordinate a critical section by claiming a
//! lease on a name. Two stores are supported: PostgreSQL advisory locks
//! (`postgres` feature) and DynamoDB conditional writes (`dynamodb`
//! feature). An in-memory backend with the same semantics is always
//! available.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use leasekeeper_core::backend::postgres::{AdvisoryLockBackend, DirectConnectionAdapter};
//! use leasekeeper_core::{LeaseKeeper, LockOptions};
//!
//! # async fn run() -> Result<(), leasekeeper_core::LockError> {
//! let backend = AdvisoryLockBackend::new(DirectConnectionAdapter::from_url(
//!     "postgres://postgres@localhost/postgres",
//! ));
//! let keeper = LeaseKeeper::new(backend);
//! let opts = LockOptions::new().with_ttl(Duration::from_secs(30));
//! keeper.lock("nightly-report", opts, || async {
//!     // only one process runs this at a time
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod options;
#[cfg(feature = "postgres")]
pub mod pool;
pub mod retry;

pub use backend::{LockBackend, MemoryBackend};
pub use config::LeaseKeeperConfig;
pub use coordinator::LeaseKeeper;
pub use error::{LockError, Result};
pub use key::advisory_key;
pub use options::LockOptions;
pub use retry::RetryPolicy;
