use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, NoTls, Socket};
use tracing::{debug, warn};

use crate::error::{LockError, Result};

/// Connection target plus TLS policy for one PostgreSQL endpoint.
#[derive(Clone)]
pub struct PgConnectOptions {
    connection_string: String,
    ssl_mode: PgSslMode,
}

impl std::fmt::Debug for PgConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectOptions")
            .field("connection_string", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PgSslMode {
    pub fn from_env() -> Self {
        let value = std::env::var("PGSSLMODE").unwrap_or_else(|_| "disable".to_string());
        Self::parse(value.as_str())
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        }
    }
}

impl PgConnectOptions {
    /// Use a `postgres://` URL or a libpq key/value string as-is.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            connection_string: url.into(),
            ssl_mode: PgSslMode::from_env(),
        }
    }

    /// Build a key/value connection string from the libpq `PG*` variables.
    pub fn from_pg_env() -> Self {
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
        let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
        let password = std::env::var("PGPASSWORD").ok();

        let mut config = format!("host={host} port={port} user={user} dbname={dbname}");
        if let Some(pwd) = password {
            config.push_str(&format!(" password={pwd}"));
        }
        Self {
            connection_string: config,
            ssl_mode: PgSslMode::from_env(),
        }
    }

    /// Prefer an explicit URL, then `DATABASE_URL`, then the `PG*` variables.
    pub fn resolve(url: Option<&str>) -> Self {
        match url {
            Some(url) => Self::from_url(url),
            None => match std::env::var("DATABASE_URL") {
                Ok(url) if !url.is_empty() => Self::from_url(url),
                _ => Self::from_pg_env(),
            },
        }
    }

    pub fn with_ssl_mode(mut self, ssl_mode: PgSslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    pub fn ssl_mode(&self) -> PgSslMode {
        self.ssl_mode
    }

    pub async fn connect(&self) -> Result<Client> {
        let target = self.connection_string.as_str();
        debug!(ssl_mode = ?self.ssl_mode, "opening PostgreSQL session");
        match build_tls_config(self.ssl_mode)? {
            TlsConfig::None => open(target, NoTls).await,
            TlsConfig::Enforced(tls) => open(target, tls).await,
            TlsConfig::Prefer(tls) => match open(target, tls).await {
                Ok(client) => Ok(client),
                Err(err) => {
                    warn!(error = %err, "TLS handshake failed under PGSSLMODE=prefer, using plaintext");
                    open(target, NoTls).await
                }
            },
        }
    }
}

enum TlsConfig {
    None,
    Prefer(MakeTlsConnector),
    Enforced(MakeTlsConnector),
}

async fn open<T>(target: &str, tls: T) -> Result<Client>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio_postgres::connect(target, tls).await?;
    // Advisory locks belong to the session, so once this task ends every
    // lock taken through `client` is gone.
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            warn!(error = %err, "lock session terminated");
        }
    });
    Ok(client)
}

fn build_tls_connector(mode: PgSslMode) -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    match mode {
        PgSslMode::Prefer | PgSslMode::Require => {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyFull => {}
        PgSslMode::Disable => {
            return Err(LockError::Config(
                "PGSSLMODE=disable should not attempt to build a TLS connector".to_string(),
            ))
        }
    }
    let connector = builder.build().map_err(|e| {
        LockError::Config(format!("failed to build TLS connector for {mode:?}: {e}"))
    })?;
    Ok(MakeTlsConnector::new(connector))
}

fn build_tls_config(mode: PgSslMode) -> Result<TlsConfig> {
    match mode {
        PgSslMode::Disable => Ok(TlsConfig::None),
        PgSslMode::Prefer => Ok(TlsConfig::Prefer(build_tls_connector(mode)?)),
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
            Ok(TlsConfig::Enforced(build_tls_connector(mode)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_mode_parser_handles_supported_and_unknown_values() {
        assert_eq!(PgSslMode::parse("disable"), PgSslMode::Disable);
        assert_eq!(PgSslMode::parse("prefer"), PgSslMode::Prefer);
        assert_eq!(PgSslMode::parse("require"), PgSslMode::Require);
        assert_eq!(PgSslMode::parse("verify-ca"), PgSslMode::VerifyCa);
        assert_eq!(PgSslMode::parse("VERIFY-FULL"), PgSslMode::VerifyFull);
        assert_eq!(PgSslMode::parse("unknown-value"), PgSslMode::Disable);
    }

    #[test]
    fn tls_config_builder_maps_modes_to_expected_variants() -> Result<()> {
        assert!(matches!(build_tls_config(PgSslMode::Disable)?, TlsConfig::None));
        assert!(matches!(build_tls_config(PgSslMode::Prefer)?, TlsConfig::Prefer(_)));
        for mode in [PgSslMode::Require, PgSslMode::VerifyCa, PgSslMode::VerifyFull] {
            assert!(matches!(build_tls_config(mode)?, TlsConfig::Enforced(_)));
        }
        Ok(())
    }

    #[test]
    fn tls_connector_builder_rejects_disable_mode() {
        assert!(build_tls_connector(PgSslMode::Disable).is_err());
    }

    #[test]
    fn explicit_url_wins_and_debug_output_hides_credentials() {
        let opts = PgConnectOptions::resolve(Some("postgres://app:s3cret@db/leases"))
            .with_ssl_mode(PgSslMode::Require);
        assert_eq!(opts.ssl_mode(), PgSslMode::Require);
        let rendered = format!("{opts:?}");
        assert!(!rendered.contains("s3cret"));
    }
}
