use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailpoll::errors::{AppError, AppResult};
use mailpoll::lock::{HolderId, LockNamespace, Locking, MemoryLocking, RemoteReentrantLock, SqliteLocking};
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;

fn namespace() -> LockNamespace {
    LockNamespace::new("bot@example.com@mail.example.com/INBOX")
}

#[tokio::test]
async fn same_holder_reenters_with_one_remote_hold() {
    let service = MemoryLocking::new();
    let lock = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let me = HolderId::new();

    assert!(lock.try_lock_as(me).await);
    assert!(lock.try_lock_as(me).await);
    assert_eq!(lock.hold_count(), 2);
    assert_eq!(service.outstanding(), 1);
    assert_eq!(service.acquisitions(), 1);

    lock.unlock_as(me).await.expect("inner unlock");
    assert!(lock.is_held_by(me));
    assert_eq!(service.outstanding(), 1);
    assert_eq!(service.releases(), 0);

    lock.unlock_as(me).await.expect("outer unlock");
    assert!(!lock.is_held());
    assert_eq!(service.outstanding(), 0);
    assert_eq!(service.releases(), 1);

    assert!(matches!(
        lock.unlock_as(me).await,
        Err(AppError::LockNotHeld(_))
    ));
    assert_eq!(service.releases(), 1);
}

#[tokio::test]
async fn other_local_holder_is_refused_without_remote_call() {
    let service = MemoryLocking::new();
    let lock = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let owner = HolderId::new();
    let intruder = HolderId::new();

    assert!(lock.try_lock_as(owner).await);
    assert!(!lock.try_lock_as(intruder).await);
    assert!(matches!(
        lock.unlock_as(intruder).await,
        Err(AppError::LockNotHeld(_))
    ));
    assert_eq!(service.acquisitions(), 1);

    lock.unlock_as(owner).await.expect("unlock");
    assert!(lock.try_lock_as(intruder).await);
    lock.unlock_as(intruder).await.expect("unlock");
}

#[tokio::test]
async fn thread_holder_excludes_other_threads() {
    let service = MemoryLocking::new();
    let lock = Arc::new(RemoteReentrantLock::new(
        Arc::new(service.client("worker-1")),
        namespace(),
    ));

    assert!(lock.try_lock().await);
    assert!(lock.try_lock().await);
    assert!(lock.is_held_by_current());

    let remote_view = Arc::clone(&lock);
    let acquired_elsewhere = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(remote_view.try_lock())
    })
    .join()
    .expect("thread");
    assert!(!acquired_elsewhere);

    lock.unlock().await.expect("unlock");
    lock.unlock().await.expect("unlock");
    assert_eq!(service.outstanding(), 0);
    assert_eq!(service.releases(), 1);
}

#[tokio::test]
async fn second_process_is_excluded_until_release() {
    let service = MemoryLocking::new();
    let first = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let second = RemoteReentrantLock::new(Arc::new(service.client("worker-2")), namespace());
    let a = HolderId::new();
    let b = HolderId::new();

    assert!(first.try_lock_as(a).await);
    assert!(!second.try_lock_as(b).await);
    assert!(!second.is_held());

    first.unlock_as(a).await.expect("unlock");
    assert!(second.try_lock_as(b).await);
    assert_eq!(service.holder_of(namespace().as_str()).as_deref(), Some("worker-2"));
    second.unlock_as(b).await.expect("unlock");
}

#[tokio::test]
async fn lock_until_gives_up_after_wait() {
    let service = MemoryLocking::new();
    let first = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let second = RemoteReentrantLock::new(Arc::new(service.client("worker-2")), namespace())
        .with_retry_interval(Duration::from_millis(5));
    let a = HolderId::new();
    let b = HolderId::new();
    assert!(first.try_lock_as(a).await);

    let acquired = second
        .lock_until_as(b, Duration::from_millis(40), &CancellationToken::new())
        .await
        .expect("no error");
    assert!(!acquired);
    assert!(!second.is_held());
}

#[tokio::test]
async fn lock_until_acquires_once_released() {
    let service = MemoryLocking::new();
    let first = Arc::new(RemoteReentrantLock::new(
        Arc::new(service.client("worker-1")),
        namespace(),
    ));
    let second = RemoteReentrantLock::new(Arc::new(service.client("worker-2")), namespace())
        .with_retry_interval(Duration::from_millis(5));
    let a = HolderId::new();
    let b = HolderId::new();
    assert!(first.try_lock_as(a).await);

    let releaser = Arc::clone(&first);
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        releaser.unlock_as(a).await
    });

    let acquired = second
        .lock_until_as(b, Duration::from_secs(5), &CancellationToken::new())
        .await
        .expect("no error");
    assert!(acquired);
    release.await.expect("join").expect("unlock");
    second.unlock_as(b).await.expect("unlock");
}

#[tokio::test]
async fn lock_until_honours_cancellation() {
    let service = MemoryLocking::new();
    let first = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let second = RemoteReentrantLock::new(Arc::new(service.client("worker-2")), namespace());
    let a = HolderId::new();
    assert!(first.try_lock_as(a).await);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = second
        .lock_until_as(HolderId::new(), Duration::from_secs(5), &cancel)
        .await;
    assert!(matches!(result, Err(AppError::Cancelled)));
}

/// Grants holds on the shared table, but only answers after `delay`.
struct SlowLocking {
    inner: MemoryLocking,
    delay: Duration,
}

#[async_trait]
impl Locking for SlowLocking {
    async fn lock(&self, namespace: &str) -> AppResult<bool> {
        let acquired = self.inner.lock(namespace).await?;
        tokio::time::sleep(self.delay).await;
        Ok(acquired)
    }

    async fn unlock(&self, namespace: &str) -> AppResult<()> {
        self.inner.unlock(namespace).await
    }
}

#[tokio::test]
async fn cancel_during_remote_acquire_leaves_no_hold() {
    let service = MemoryLocking::new();
    let lock = RemoteReentrantLock::new(
        Arc::new(SlowLocking {
            inner: service.client("worker-1"),
            delay: Duration::from_millis(200),
        }),
        namespace(),
    );
    let me = HolderId::new();
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();

    let (result, ()) = tokio::join!(
        lock.lock_until_as(me, Duration::from_secs(5), &cancel),
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        }
    );

    assert!(matches!(result, Err(AppError::Cancelled)));
    assert!(!lock.is_held());
    assert_eq!(service.outstanding(), 0);
    assert_eq!(service.holder_of(namespace().as_str()), None);
}

#[tokio::test]
async fn renew_reports_whether_hold_survives() {
    let service = MemoryLocking::new();
    let lock = RemoteReentrantLock::new(Arc::new(service.client("worker-1")), namespace());
    let me = HolderId::new();

    assert!(!lock.renew().await.expect("renew"));
    assert!(lock.try_lock_as(me).await);
    assert!(lock.renew().await.expect("renew"));
    lock.unlock_as(me).await.expect("unlock");
    assert!(!lock.renew().await.expect("renew"));
}

struct UnavailableLocking;

#[async_trait]
impl Locking for UnavailableLocking {
    async fn lock(&self, _namespace: &str) -> AppResult<bool> {
        Err(AppError::Lock("service down".into()))
    }

    async fn unlock(&self, _namespace: &str) -> AppResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unavailable_service_reports_not_acquired() {
    let lock = RemoteReentrantLock::new(Arc::new(UnavailableLocking), namespace());
    let me = HolderId::new();

    assert!(!lock.try_lock_as(me).await);
    assert!(!lock.is_held());
    assert_eq!(lock.hold_count(), 0);
}

async fn memory_pool() -> sqlx::SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

#[tokio::test]
async fn sqlite_locking_excludes_other_holders() {
    let pool = memory_pool().await;
    let a = SqliteLocking::from_pool(pool.clone())
        .await
        .expect("a")
        .with_holder("worker-a");
    let b = SqliteLocking::from_pool(pool)
        .await
        .expect("b")
        .with_holder("worker-b");
    let ns = namespace();

    assert!(a.lock(ns.as_str()).await.unwrap());
    assert!(!a.lock(ns.as_str()).await.unwrap());
    assert!(!b.lock(ns.as_str()).await.unwrap());

    b.unlock(ns.as_str()).await.unwrap();
    assert_eq!(
        a.holder_of(ns.as_str()).await.unwrap().as_deref(),
        Some("worker-a")
    );

    a.unlock(ns.as_str()).await.unwrap();
    a.unlock(ns.as_str()).await.unwrap();
    assert!(b.lock(ns.as_str()).await.unwrap());
}

#[tokio::test]
async fn sqlite_lease_reclaims_abandoned_hold() {
    let pool = memory_pool().await;
    let locking = SqliteLocking::from_pool(pool.clone())
        .await
        .expect("locking")
        .with_holder("worker-new")
        .with_lease(Duration::from_secs(60));
    sqlx::query("INSERT INTO remote_locks (namespace, holder, acquired_at) VALUES (?1, 'crashed', 0)")
        .bind(namespace().as_str())
        .execute(&pool)
        .await
        .expect("seed stale hold");

    assert!(locking.lock(namespace().as_str()).await.unwrap());
    assert_eq!(
        locking.holder_of(namespace().as_str()).await.unwrap().as_deref(),
        Some("worker-new")
    );
}

#[tokio::test]
async fn sqlite_renewal_keeps_hold_past_lease() {
    let pool = memory_pool().await;
    let owner = SqliteLocking::from_pool(pool.clone())
        .await
        .expect("owner")
        .with_holder("worker-a")
        .with_lease(Duration::from_secs(60));
    let rival = SqliteLocking::from_pool(pool.clone())
        .await
        .expect("rival")
        .with_holder("worker-b")
        .with_lease(Duration::from_secs(60));
    let ns = namespace();
    assert!(owner.lock(ns.as_str()).await.unwrap());

    // Age the hold past the lease, then renew it as a live holder would.
    sqlx::query("UPDATE remote_locks SET acquired_at = 0 WHERE namespace = ?1")
        .bind(ns.as_str())
        .execute(&pool)
        .await
        .expect("age hold");
    assert!(owner.renew(ns.as_str()).await.unwrap());
    assert!(!rival.renew(ns.as_str()).await.unwrap());

    assert!(!rival.lock(ns.as_str()).await.unwrap());
    assert_eq!(
        owner.holder_of(ns.as_str()).await.unwrap().as_deref(),
        Some("worker-a")
    );
}

#[tokio::test]
async fn reentrant_lock_over_sqlite() {
    let pool = memory_pool().await;
    let shared: Arc<dyn Locking> = Arc::new(
        SqliteLocking::from_pool(pool.clone())
            .await
            .expect("locking")
            .with_holder("worker-a"),
    );
    let rival = SqliteLocking::from_pool(pool)
        .await
        .expect("rival")
        .with_holder("worker-b");
    let lock = RemoteReentrantLock::new(shared, namespace());
    let me = HolderId::new();

    assert!(lock.try_lock_as(me).await);
    assert!(lock.try_lock_as(me).await);
    lock.unlock_as(me).await.unwrap();
    assert!(!rival.lock(namespace().as_str()).await.unwrap());

    lock.unlock_as(me).await.unwrap();
    assert!(rival.lock(namespace().as_str()).await.unwrap());
}
