use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::debug;

use super::connect::PgConnectOptions;
use crate::error::{LockError, Result};
use crate::pool::{PgPool, PooledClient};

/// Callback invoked with store errors raised through an adapter.
pub type ErrorHandler = Arc<dyn Fn(&LockError) + Send + Sync>;

/// Source of PostgreSQL sessions for the advisory-lock driver.
///
/// A checked-out handle stays valid until it is dropped, so the driver can
/// keep the session that took an advisory lock and unlock on that same
/// session later.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync + 'static {
    type Connection: Deref<Target = Client> + Send + Sync + 'static;

    async fn checkout(&self) -> Result<Self::Connection>;

    /// Hook for store errors. The error is still returned to the caller.
    fn report_error(&self, _err: &LockError) {}

    /// Take a session out of circulation because it may still hold advisory
    /// locks nobody tracks.
    fn discard(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Check out a session for the duration of `f`.
    fn with_connection<'a, T, F, Fut>(&'a self, f: F) -> impl Future<Output = Result<T>> + Send + 'a
    where
        Self: Sized,
        T: Send + 'a,
        F: FnOnce(Self::Connection) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        async move {
            let conn = match self.checkout().await {
                Ok(conn) => conn,
                Err(err) => {
                    self.report_error(&err);
                    return Err(err);
                }
            };
            let result = f(conn).await;
            if let Err(err) = &result {
                self.report_error(err);
            }
            result
        }
    }
}

/// Opens one session from a URL on first use and hands it out to every call.
///
/// A closed or discarded session is replaced on the next checkout.
pub struct DirectConnectionAdapter {
    connect: PgConnectOptions,
    client: Mutex<Option<Arc<Client>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl DirectConnectionAdapter {
    pub fn new(connect: PgConnectOptions) -> Self {
        Self {
            connect,
            client: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(PgConnectOptions::from_url(url))
    }

    fn lock_client(&self) -> Result<std::sync::MutexGuard<'_, Option<Arc<Client>>>> {
        self.client
            .lock()
            .map_err(|e| LockError::Pool(format!("session slot poisoned: {e}")))
    }

    fn current(&self) -> Result<Option<Arc<Client>>> {
        Ok(self
            .lock_client()?
            .as_ref()
            .filter(|client| !client.is_closed())
            .cloned())
    }
}

#[async_trait]
impl ConnectionAdapter for DirectConnectionAdapter {
    type Connection = Arc<Client>;

    async fn checkout(&self) -> Result<Arc<Client>> {
        if let Some(client) = self.current()? {
            return Ok(client);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(client) = self.current()? {
            return Ok(client);
        }
        debug!("opening shared PostgreSQL session");
        let client = Arc::new(self.connect.connect().await?);
        *self.lock_client()? = Some(Arc::clone(&client));
        Ok(client)
    }

    // Leases still held on the old session keep it open until they release;
    // the session and whatever it holds close with the last of them.
    fn discard(&self, conn: Arc<Client>) {
        if let Ok(mut slot) = self.lock_client() {
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &conn)) {
                debug!("retiring shared PostgreSQL session");
                *slot = None;
            }
        }
    }
}

/// Borrows sessions from an externally managed [`PgPool`].
pub struct PooledConnectionAdapter {
    pool: PgPool,
    error_handler: ErrorHandler,
}

impl PooledConnectionAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            error_handler: Arc::new(|_| {}),
        }
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&LockError) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionAdapter for PooledConnectionAdapter {
    type Connection = PooledClient;

    async fn checkout(&self) -> Result<PooledClient> {
        self.pool.get().await
    }

    fn report_error(&self, err: &LockError) {
        (self.error_handler)(err);
    }

    fn discard(&self, mut conn: PooledClient) {
        conn.mark_broken();
    }
}
