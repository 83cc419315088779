//! Conditional-write backend over DynamoDB.
//!
//! A lease is an item `{Name, Created}` in a table keyed by `Name`. Creation
//! is a `PutItem` guarded by `attribute_not_exists(Name)`; a lease whose
//! holder died stays in the table until a later acquirer finds it older than
//! its ttl and deletes it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::LockBackend;
use crate::error::{LockError, Result};
use crate::options::LockOptions;
use crate::retry::RetryPolicy;

pub const NAME_ATTRIBUTE: &str = "Name";
pub const CREATED_ATTRIBUTE: &str = "Created";

/// Connection settings for the DynamoDB client.
#[derive(Clone, Default)]
pub struct DynamoSettings {
    pub table: String,
    pub region: Option<String>,
    /// Custom endpoint, e.g. DynamoDB Local.
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for DynamoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoSettings")
            .field("table", &self.table)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DynamoSettings {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

/// Key layout learned from `DescribeTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableSchema {
    hash_key: String,
}

/// DynamoDB conditional-write driver.
///
/// The SDK client and the table schema are loaded on first use and shared by
/// every later call on this backend.
pub struct DynamoLockBackend {
    settings: DynamoSettings,
    client: OnceCell<Client>,
    schemas: Mutex<HashMap<String, TableSchema>>,
}

impl DynamoLockBackend {
    pub fn new(settings: DynamoSettings) -> Self {
        Self {
            settings,
            client: OnceCell::new(),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Use an already configured SDK client.
    pub fn with_client(settings: DynamoSettings, client: Client) -> Self {
        Self {
            settings,
            client: OnceCell::new_with(Some(client)),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &str {
        &self.settings.table
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = &self.settings.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                if let Some(endpoint) = &self.settings.endpoint_url {
                    loader = loader.endpoint_url(endpoint);
                }
                if let (Some(id), Some(secret)) = (
                    &self.settings.access_key_id,
                    &self.settings.secret_access_key,
                ) {
                    loader = loader.credentials_provider(Credentials::new(
                        id.clone(),
                        secret.clone(),
                        None,
                        None,
                        "leasekeeper",
                    ));
                }
                debug!(table = %self.settings.table, "initialising DynamoDB client");
                Client::new(&loader.load().await)
            })
            .await
    }

    /// Client for the lease table, validating its key schema once.
    async fn leases(&self) -> Result<&Client> {
        let client = self.client().await;
        let table = &self.settings.table;
        let mut schemas = self.schemas.lock().await;
        if !schemas.contains_key(table) {
            let schema = load_schema(client, table).await?;
            if schema.hash_key != NAME_ATTRIBUTE {
                return Err(LockError::DynamoDb(format!(
                    "table {table} is keyed by {:?}, expected {NAME_ATTRIBUTE:?}",
                    schema.hash_key
                )));
            }
            schemas.insert(table.clone(), schema);
        }
        Ok(client)
    }

    /// Create the lease table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let client = self.client().await;
        let table = &self.settings.table;
        match client.describe_table().table_name(table).send().await {
            Ok(_) => return Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) => {}
            Err(err) => return Err(dynamo_error("describing table", err)),
        }

        client
            .create_table()
            .table_name(table)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(NAME_ATTRIBUTE)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(|e| LockError::DynamoDb(e.to_string()))?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(NAME_ATTRIBUTE)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(|e| LockError::DynamoDb(e.to_string()))?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| dynamo_error("creating table", e))?;
        info!(table = %table, "created DynamoDB lease table");
        Ok(())
    }

    async fn put_if_absent(&self, name: &str) -> Result<bool> {
        let client = self.leases().await?;
        let result = client
            .put_item()
            .table_name(&self.settings.table)
            .item(NAME_ATTRIBUTE, AttributeValue::S(name.to_string()))
            .item(
                CREATED_ATTRIBUTE,
                AttributeValue::N(Utc::now().timestamp().to_string()),
            )
            .condition_expression("attribute_not_exists(#name)")
            .expression_attribute_names("#name", NAME_ATTRIBUTE)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(lease = name, table = %self.settings.table, "created DynamoDB lease");
                Ok(true)
            }
            Err(err) if is_conditional_check_failure(&err) => {
                debug!(lease = name, table = %self.settings.table, "DynamoDB lease already exists");
                Ok(false)
            }
            Err(err) => Err(dynamo_error("putting lease", err)),
        }
    }
}

async fn load_schema(client: &Client, table: &str) -> Result<TableSchema> {
    let output = client
        .describe_table()
        .table_name(table)
        .send()
        .await
        .map_err(|e| dynamo_error("describing table", e))?;
    let hash_key = output
        .table()
        .map(|t| t.key_schema())
        .unwrap_or_default()
        .iter()
        .find(|k| k.key_type() == &KeyType::Hash)
        .map(|k| k.attribute_name().to_string())
        .ok_or_else(|| LockError::DynamoDb(format!("table {table} has no hash key")))?;
    Ok(TableSchema { hash_key })
}

fn is_conditional_check_failure<R>(err: &SdkError<PutItemError, R>) -> bool {
    matches!(
        err.as_service_error(),
        Some(PutItemError::ConditionalCheckFailedException(_))
    )
}

fn dynamo_error<E, R>(action: &str, err: SdkError<E, R>) -> LockError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    LockError::DynamoDb(format!(
        "{action}: {}",
        aws_sdk_dynamodb::error::DisplayErrorContext(err)
    ))
}

/// A lease created at `created` (epoch seconds) is stale once it is strictly
/// older than `now - ttl`.
fn is_expired(created: i64, now: i64, ttl: Duration) -> bool {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    created < now.saturating_sub(ttl)
}

fn parse_created(item: &HashMap<String, AttributeValue>) -> Option<i64> {
    match item.get(CREATED_ATTRIBUTE)? {
        AttributeValue::N(n) => n.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl LockBackend for DynamoLockBackend {
    async fn create(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        RetryPolicy::immediate(opts.attempts)
            .run(move |_| self.put_if_absent(name))
            .await
    }

    async fn delete(&self, name: &str, _opts: &LockOptions) -> Result<()> {
        let client = self.leases().await?;
        client
            .delete_item()
            .table_name(&self.settings.table)
            .key(NAME_ATTRIBUTE, AttributeValue::S(name.to_string()))
            .send()
            .await
            .map_err(|e| dynamo_error("deleting lease", e))?;
        debug!(lease = name, table = %self.settings.table, "deleted DynamoDB lease");
        Ok(())
    }

    async fn expired(&self, name: &str, ttl: Duration) -> Result<bool> {
        let client = self.leases().await?;
        let output = client
            .get_item()
            .table_name(&self.settings.table)
            .key(NAME_ATTRIBUTE, AttributeValue::S(name.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| dynamo_error("reading lease", e))?;
        Ok(output
            .item()
            .and_then(parse_created)
            .is_some_and(|created| is_expired(created, Utc::now().timestamp(), ttl)))
    }
}
