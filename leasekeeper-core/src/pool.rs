//! Bounded async pool of PostgreSQL sessions.
//!
//! Used behind [`PooledConnectionAdapter`](crate::backend::postgres::PooledConnectionAdapter)
//! when the application already manages a set of connections and the lock
//! driver should borrow from it instead of opening its own session.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::Client;
use tracing::debug;

use crate::backend::postgres::PgConnectOptions;
use crate::error::{LockError, Result};

/// Configuration options for [`PgPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    /// Idle sessions older than this are closed; `0` keeps them forever.
    pub idle_ttl_ms: u64,
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(LockError::Pool(
                "PoolConfig.max_size must be greater than 0".to_string(),
            ));
        }
        if self.min_idle > self.max_size {
            return Err(LockError::Pool(format!(
                "PoolConfig.min_idle ({}) exceeds max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            min_idle: 0,
            max_size: cpus.saturating_mul(2).clamp(4, 16),
            acquire_timeout_ms: 30_000,
            idle_ttl_ms: 300_000,
        }
    }
}

struct IdleConnection {
    client: Arc<Client>,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
}

fn evict_idle(state: &mut PoolState, idle_ttl_ms: u64) -> usize {
    let before = state.idle.len();
    state.idle.retain(|entry| !entry.client.is_closed());
    if idle_ttl_ms > 0 {
        let ttl = Duration::from_millis(idle_ttl_ms);
        state.idle.retain(|entry| entry.last_used.elapsed() < ttl);
    }
    before - state.idle.len()
}

struct PoolInner {
    connect: PgConnectOptions,
    config: PoolConfig,
    state: Mutex<PoolState>,
    total: AtomicUsize,
    semaphore: Arc<Semaphore>,
}

impl PoolInner {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|e| LockError::Pool(format!("postgres pool mutex poisoned: {e}")))
    }

    async fn acquire(self: &Arc<Self>) -> Result<PooledClient> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(LockError::Pool(
                    "connection pool closed while waiting for permit".to_string(),
                ))
            }
            Err(_) => {
                return Err(LockError::Pool(format!(
                    "timed out waiting for pool connection (max_size={}, acquire_timeout_ms={})",
                    self.config.max_size, self.config.acquire_timeout_ms
                )))
            }
        };

        let (idle, should_create) = {
            let mut state = self.lock_state()?;
            self.evict_idle_locked(&mut state);
            match state.idle.pop() {
                Some(idle) => (Some(idle.client), false),
                None if self.total.load(Ordering::SeqCst) < self.config.max_size => {
                    self.total.fetch_add(1, Ordering::SeqCst);
                    (None, true)
                }
                None => (None, false),
            }
        };

        if let Some(client) = idle {
            return Ok(PooledClient::new(client, self.clone(), permit));
        }
        if !should_create {
            return Err(LockError::Pool(format!(
                "connection pool exhausted (max_size={})",
                self.config.max_size
            )));
        }
        match self.connect.connect().await {
            Ok(client) => {
                debug!(total = self.total.load(Ordering::SeqCst), "opened pooled PostgreSQL session");
                Ok(PooledClient::new(Arc::new(client), self.clone(), permit))
            }
            Err(err) => {
                self.total.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn release(&self, client: Arc<Client>) {
        let Ok(mut state) = self.lock_state() else {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return;
        };
        self.evict_idle_locked(&mut state);
        state.idle.push(IdleConnection {
            client,
            last_used: Instant::now(),
        });
    }

    fn discard(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    fn evict_idle_locked(&self, state: &mut PoolState) {
        let removed = evict_idle(state, self.config.idle_ttl_ms);
        if removed > 0 {
            self.total.fetch_sub(removed, Ordering::SeqCst);
        }
    }
}

/// A session checked out of a [`PgPool`]. Returned to the pool on drop.
pub struct PooledClient {
    client: Arc<Client>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
}

impl PooledClient {
    fn new(client: Arc<Client>, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            client,
            pool,
            _permit: permit,
            broken: false,
        }
    }

    /// Close this session instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.broken || self.client.is_closed() {
            self.pool.discard();
        } else {
            self.pool.release(self.client.clone());
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub total: usize,
    pub max_size: usize,
}

/// Async connection pool for PostgreSQL sessions.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create a pool, opening `config.min_idle` sessions up front.
    pub async fn new(connect: PgConnectOptions, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            connect,
            config,
            state: Mutex::new(PoolState { idle: Vec::new() }),
            total: AtomicUsize::new(0),
        });

        for _ in 0..inner.config.min_idle {
            let client = inner.connect.connect().await?;
            inner.total.fetch_add(1, Ordering::SeqCst);
            inner.lock_state()?.idle.push(IdleConnection {
                client: Arc::new(client),
                last_used: Instant::now(),
            });
        }

        Ok(Self { inner })
    }

    pub async fn with_default(connect: PgConnectOptions) -> Result<Self> {
        Self::new(connect, PoolConfig::default()).await
    }

    /// Check out a session, waiting up to `acquire_timeout_ms` for a permit.
    pub async fn get(&self) -> Result<PooledClient> {
        self.inner.acquire().await
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self
            .inner
            .lock_state()
            .map(|state| state.idle.len())
            .unwrap_or(0);
        PoolStatus {
            idle,
            total: self.inner.total.load(Ordering::SeqCst),
            max_size: self.inner.config.max_size,
        }
    }
}
