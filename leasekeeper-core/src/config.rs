use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::key::DEFAULT_LOCK_SPACE;

#[derive(Clone, Deserialize, Serialize)]
pub struct LeaseKeeperConfig {
    /// PostgreSQL URL for the advisory-lock backend. Falls back to
    /// `DATABASE_URL`, then the libpq `PG*` variables.
    pub database_url: Option<String>,
    /// Lock space override for advisory locks.
    pub pg_lock_space: Option<i32>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    /// Custom DynamoDB endpoint, e.g. DynamoDB Local.
    pub dynamodb_endpoint: Option<String>,
    pub dynamodb_table: String,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for LeaseKeeperConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pg_lock_space: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: None,
            dynamodb_endpoint: None,
            dynamodb_table: "leases".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

impl std::fmt::Debug for LeaseKeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("LeaseKeeperConfig")
            .field("database_url", &redact(&self.database_url))
            .field("pg_lock_space", &self.pg_lock_space)
            .field("aws_access_key_id", &redact(&self.aws_access_key_id))
            .field("aws_secret_access_key", &redact(&self.aws_secret_access_key))
            .field("aws_region", &self.aws_region)
            .field("dynamodb_endpoint", &self.dynamodb_endpoint)
            .field("dynamodb_table", &self.dynamodb_table)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl LeaseKeeperConfig {
    /// Load defaults overlaid with `LEASEKEEPER_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config::Environment::with_prefix("LEASEKEEPER"))
    }

    fn load_from(env: config::Environment) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(env.try_parsing(true))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: LeaseKeeperConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lock space applied when a call does not pick one.
    pub fn lock_space(&self) -> i32 {
        self.pg_lock_space.unwrap_or(DEFAULT_LOCK_SPACE)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dynamodb_table.trim().is_empty() {
            anyhow::bail!("dynamodb_table must not be empty");
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            anyhow::bail!(
                "log_format must be \"compact\" or \"json\", got {:?}",
                self.log_format
            );
        }
        if self.aws_access_key_id.is_some() != self.aws_secret_access_key.is_some() {
            anyhow::bail!("aws_access_key_id and aws_secret_access_key must be set together");
        }
        Ok(())
    }

    #[cfg(feature = "postgres")]
    pub fn pg_connect_options(&self) -> crate::backend::postgres::PgConnectOptions {
        crate::backend::postgres::PgConnectOptions::resolve(self.database_url.as_deref())
    }

    #[cfg(feature = "dynamodb")]
    pub fn dynamo_settings(&self) -> crate::backend::dynamodb::DynamoSettings {
        crate::backend::dynamodb::DynamoSettings {
            table: self.dynamodb_table.clone(),
            region: self.aws_region.clone(),
            endpoint_url: self.dynamodb_endpoint.clone(),
            access_key_id: self.aws_access_key_id.clone(),
            secret_access_key: self.aws_secret_access_key.clone(),
        }
    }
}
