#![cfg(feature = "dynamodb")]

use std::time::Duration;

use leasekeeper_core::backend::dynamodb::{DynamoLockBackend, DynamoSettings};
use leasekeeper_core::{LeaseKeeper, LockBackend, LockError, LockOptions, Result};

/// Live tests target DynamoDB Local (or a real endpoint); they pass
/// trivially when no endpoint is configured.
fn settings() -> Option<DynamoSettings> {
    let endpoint = std::env::var("LEASEKEEPER_TEST_DYNAMODB_ENDPOINT")
        .ok()
        .filter(|v| !v.is_empty())?;
    Some(DynamoSettings {
        table: std::env::var("LEASEKEEPER_TEST_DYNAMODB_TABLE")
            .unwrap_or_else(|_| "leasekeeper_test".to_string()),
        region: Some("us-east-1".to_string()),
        endpoint_url: Some(endpoint),
        access_key_id: Some("local".to_string()),
        secret_access_key: Some("local".to_string()),
    })
}

fn unique_name(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{nanos}")
}

#[tokio::test]
async fn conditional_create_excludes_second_writer() -> Result<()> {
    let Some(settings) = settings() else {
        return Ok(());
    };
    let keeper = LeaseKeeper::new(DynamoLockBackend::new(settings.clone()));
    keeper.backend().ensure_table().await?;
    let rival = DynamoLockBackend::new(settings);
    let name = unique_name("contended");
    let opts = LockOptions::new().with_ttl(Duration::from_secs(30));

    keeper
        .lock(&name, opts.clone(), || async {
            assert!(!rival.create(&name, &opts).await?);
            Ok::<_, LockError>(())
        })
        .await??;

    assert!(!rival.expired(&name, opts.ttl).await?);
    assert!(rival.create(&name, &opts).await?);
    rival.delete(&name, &opts).await?;
    Ok(())
}

#[tokio::test]
async fn stale_lease_is_reclaimed_by_next_acquirer() -> Result<()> {
    let Some(settings) = settings() else {
        return Ok(());
    };
    let stale = DynamoLockBackend::new(settings.clone());
    stale.ensure_table().await?;
    let name = unique_name("stale");
    let opts = LockOptions::new().with_ttl(Duration::from_secs(1));
    assert!(stale.create(&name, &opts).await?);

    // Created has second resolution and expiry is strict.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(stale.expired(&name, opts.ttl).await?);

    let keeper = LeaseKeeper::new(DynamoLockBackend::new(settings));
    let ran = keeper
        .lock(&name, opts.with_ttl(Duration::from_secs(10)).with_attempts(1), || async {
            true
        })
        .await;
    // ttl 10 makes the 2.5s-old lease live again, so the lock must fail
    assert!(matches!(ran, Err(LockError::UnableToLock { .. })));

    let ran = keeper
        .lock(&name, LockOptions::new().with_ttl(Duration::from_secs(1)), || async { true })
        .await?;
    assert!(ran);
    assert!(!keeper.backend().expired(&name, Duration::ZERO).await?);
    Ok(())
}
