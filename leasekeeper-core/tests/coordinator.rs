use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leasekeeper_core::{LeaseKeeper, LockBackend, LockError, LockOptions, MemoryBackend, Result};

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn wait_until_released(keeper: &LeaseKeeper<MemoryBackend>, name: &str) -> bool {
    eventually(|| !keeper.backend().contains(name)).await
}

/// Memory store whose deletes take `delay` to land.
struct SlowRelease {
    store: MemoryBackend,
    delay: Duration,
}

#[async_trait]
impl LockBackend for SlowRelease {
    async fn create(&self, name: &str, opts: &LockOptions) -> Result<bool> {
        self.store.create(name, opts).await
    }

    async fn delete(&self, name: &str, opts: &LockOptions) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.store.delete(name, opts).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holders_never_overlap() -> Result<()> {
    let keeper = LeaseKeeper::new(MemoryBackend::new());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let keeper = keeper.clone();
        let active = active.clone();
        let peak = peak.clone();
        let completed = completed.clone();
        tasks.push(tokio::spawn(async move {
            let opts = LockOptions::new().with_attempts(1);
            let result = keeper
                .lock("shared", opts, || async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            match result {
                Ok(()) => true,
                Err(err) if err.is_unable_to_lock() => false,
                Err(err) => panic!("unexpected lock error: {err}"),
            }
        }));
    }

    let mut acquired = 0;
    for task in tasks {
        if task.await.expect("lock task panicked") {
            acquired += 1;
        }
    }

    assert!(acquired >= 1);
    assert_eq!(completed.load(Ordering::SeqCst), acquired);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(!keeper.backend().contains("shared"));
    Ok(())
}

#[tokio::test]
async fn exhausted_attempts_fail_without_touching_the_store() {
    let backend = MemoryBackend::new();
    backend.set_always_contended(true);
    let keeper = LeaseKeeper::new(backend);

    let result = keeper.lock_with_default("job-42", || async {}).await;

    match result {
        Err(LockError::UnableToLock { name, attempts }) => {
            assert_eq!(name, "job-42");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected UnableToLock, got {other:?}"),
    }
    assert_eq!(keeper.backend().create_attempts(), 3);
    assert_eq!(keeper.backend().deletes(), 0);
    assert!(!keeper.backend().contains("job-42"));
}

#[tokio::test]
async fn live_lease_held_elsewhere_is_left_alone() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_with_age("job-42", Duration::from_secs(5))?;
    let keeper = LeaseKeeper::new(backend);

    let result = keeper.lock_with_default("job-42", || async {}).await;

    assert!(matches!(result, Err(LockError::UnableToLock { .. })));
    assert!(keeper.backend().contains("job-42"));
    assert_eq!(keeper.backend().deletes(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_deleted_before_create() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_with_age("job-42", Duration::from_secs(10))?;
    let keeper = LeaseKeeper::new(backend);

    let opts = LockOptions::new().with_ttl(Duration::from_secs(2));
    let ran = keeper.lock("job-42", opts, || async { true }).await?;

    assert!(ran);
    // one delete for the stale lease, one for our own release
    assert_eq!(keeper.backend().deletes(), 2);
    assert_eq!(keeper.backend().create_attempts(), 1);
    assert!(!keeper.backend().contains("job-42"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_at_ttl_not_at_section_end() {
    let keeper = LeaseKeeper::new(MemoryBackend::new());
    let start = tokio::time::Instant::now();

    let result = keeper
        .lock(
            "job-42",
            LockOptions::new().with_ttl(Duration::from_secs(1)),
            || async { tokio::time::sleep(Duration::from_secs(5)).await },
        )
        .await;

    let elapsed = start.elapsed();
    match result {
        Err(LockError::Timeout { name, ttl }) => {
            assert_eq!(name, "job-42");
            assert_eq!(ttl, Duration::from_secs(1));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));
    assert!(!keeper.backend().contains("job-42"));
}

#[tokio::test]
async fn panicking_section_still_releases() {
    let keeper = LeaseKeeper::new(MemoryBackend::new());

    let task = {
        let keeper = keeper.clone();
        tokio::spawn(async move {
            keeper
                .lock_with_default("job-42", || async { panic!("section failed") })
                .await
        })
    };
    let joined: std::result::Result<Result<()>, _> = task.await;
    assert!(joined.is_err_and(|e| e.is_panic()));

    // released inline before the panic resumed
    assert!(!keeper.backend().contains("job-42"));
    assert_eq!(keeper.backend().deletes(), 1);
}

#[tokio::test]
async fn dropping_the_lock_future_releases() {
    let keeper = LeaseKeeper::new(MemoryBackend::new());

    let outer = tokio::time::timeout(
        Duration::from_millis(20),
        keeper.lock_with_default("job-42", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }),
    )
    .await;
    assert!(outer.is_err());

    assert!(wait_until_released(&keeper, "job-42").await);
    assert_eq!(keeper.backend().deletes(), 1);
}

#[tokio::test]
async fn cancelling_during_release_still_deletes_the_lease() {
    let keeper = LeaseKeeper::new(SlowRelease {
        store: MemoryBackend::new(),
        delay: Duration::from_millis(50),
    });

    // the caller gives up while the delete is still in flight
    let outer = tokio::time::timeout(
        Duration::from_millis(30),
        keeper.lock_with_default("job-42", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }),
    )
    .await;
    assert!(outer.is_err());

    assert!(eventually(|| !keeper.backend().store.contains("job-42")).await);
    assert_eq!(keeper.backend().store.deletes(), 1);
}

#[test]
fn panic_resumes_only_after_the_lease_is_deleted() {
    let keeper = LeaseKeeper::new(MemoryBackend::new());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");

    let unwound: std::thread::Result<Result<()>> =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.block_on(
                keeper.lock_with_default("job-42", || async { panic!("section failed") }),
            )
        }));
    assert!(unwound.is_err());

    // nothing deferred to the runtime may be needed for the release
    drop(runtime);
    assert!(!keeper.backend().contains("job-42"));
    assert_eq!(keeper.backend().deletes(), 1);
}

#[tokio::test]
async fn lease_is_reusable_after_each_call() -> Result<()> {
    let keeper = LeaseKeeper::new(MemoryBackend::new());
    for i in 0..3 {
        let got = keeper.lock_with_default("job-42", || async move { i }).await?;
        assert_eq!(got, i);
    }
    assert_eq!(keeper.backend().deletes(), 3);
    Ok(())
}
