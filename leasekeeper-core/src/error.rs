use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("unable to lock {name:?} after {attempts} attempt(s)")]
    UnableToLock { name: String, attempts: u32 },
    #[error("critical section for {name:?} exceeded ttl of {ttl:?}")]
    Timeout { name: String, ttl: Duration },
    #[error("invalid lock options: {0}")]
    InvalidOptions(String),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("dynamodb error: {0}")]
    DynamoDb(String),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("failed to release lease {name:?}: {source}")]
    Release {
        name: String,
        #[source]
        source: Box<LockError>,
    },
}

impl LockError {
    pub fn is_unable_to_lock(&self) -> bool {
        matches!(self, Self::UnableToLock { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T, E = LockError> = std::result::Result<T, E>;
