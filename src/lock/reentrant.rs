use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::lock::{LockNamespace, Locking};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_HOLDER: HolderId = HolderId::new();
}

/// Local owner of a reentrant hold.
///
/// [`HolderId::current`] is tied to the OS thread. A task on a multi-threaded
/// runtime can resume on another thread after an `.await`, so async callers
/// should create one id with [`HolderId::new`] and pass it to the `_as`
/// methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

impl HolderId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        HolderId(NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn current() -> Self {
        THREAD_HOLDER.with(|id| *id)
    }
}

/// `owner` set with `depth == 0` means a remote acquisition is in flight.
#[derive(Default)]
struct HoldState {
    owner: Option<HolderId>,
    depth: usize,
}

/// Reentrant lock whose outermost acquisition also takes a hold in a shared
/// lock service, so it excludes other processes as well as other local
/// holders.
pub struct RemoteReentrantLock {
    locking: Arc<dyn Locking>,
    namespace: LockNamespace,
    state: Mutex<HoldState>,
    retry_interval: Duration,
}

/// Clears an in-flight reservation unless it was committed, including when
/// the acquiring future is dropped mid-way.
struct Reservation<'a> {
    lock: &'a RemoteReentrantLock,
    holder: HolderId,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.lock.state();
        if state.owner == Some(self.holder) && state.depth == 0 {
            state.owner = None;
        }
    }
}

impl RemoteReentrantLock {
    pub fn new(locking: Arc<dyn Locking>, namespace: LockNamespace) -> Self {
        Self {
            locking,
            namespace,
            state: Mutex::new(HoldState::default()),
            retry_interval: Duration::from_millis(500),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn namespace(&self) -> &LockNamespace {
        &self.namespace
    }

    fn state(&self) -> MutexGuard<'_, HoldState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn try_lock(&self) -> bool {
        self.try_lock_as(HolderId::current()).await
    }

    /// Never blocks on contention. Re-entry by the current owner only bumps
    /// the local depth; the first entry also has to win the remote hold.
    ///
    /// Not cancellation safe: dropping the future while the remote call is in
    /// flight can leave a remote hold with no local owner. Use
    /// [`lock_until_as`](Self::lock_until_as) to wait with a cancel token.
    pub async fn try_lock_as(&self, holder: HolderId) -> bool {
        {
            let mut state = self.state();
            let owner = state.owner;
            match owner {
                Some(owner) if owner == holder && state.depth > 0 => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => {
                    debug!(namespace = %self.namespace, "Lock busy in this process");
                    return false;
                }
                None => state.owner = Some(holder),
            }
        }
        let mut reservation = Reservation {
            lock: self,
            holder,
            committed: false,
        };

        let acquired = match self.locking.lock(self.namespace.as_str()).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Lock service unavailable");
                false
            }
        };
        if !acquired {
            debug!(namespace = %self.namespace, "Lock held by another process");
            return false;
        }

        // The reservation keeps every other local holder out while the remote
        // call runs, so the commit always finds its own reservation.
        self.state().depth = 1;
        reservation.committed = true;
        debug!(namespace = %self.namespace, "Lock acquired");
        true
    }

    pub async fn lock_until(&self, wait: Duration, cancel: &CancellationToken) -> AppResult<bool> {
        self.lock_until_as(HolderId::current(), wait, cancel).await
    }

    /// Retries [`try_lock_as`](Self::try_lock_as) until it succeeds, `wait`
    /// elapses (`Ok(false)`), or `cancel` fires.
    ///
    /// Cancellation is only observed between attempts: a remote acquisition
    /// that is already in flight runs to completion, and a hold won after
    /// `cancel` fired is given back before returning `Cancelled`.
    pub async fn lock_until_as(
        &self,
        holder: HolderId,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> AppResult<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if self.try_lock_as(holder).await {
                if cancel.is_cancelled() {
                    self.unlock_as(holder).await?;
                    return Err(AppError::Cancelled);
                }
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let pause = self.retry_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub async fn unlock(&self) -> AppResult<()> {
        self.unlock_as(HolderId::current()).await
    }

    /// The remote hold goes away only when the outermost acquisition unwinds,
    /// and the local hold is cleared before that.
    pub async fn unlock_as(&self, holder: HolderId) -> AppResult<()> {
        let release = {
            let mut state = self.state();
            if state.owner != Some(holder) || state.depth == 0 {
                return Err(AppError::LockNotHeld(self.namespace.to_string()));
            }
            state.depth -= 1;
            if state.depth == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };

        if release {
            self.locking.unlock(self.namespace.as_str()).await?;
            debug!(namespace = %self.namespace, "Lock released");
        }
        Ok(())
    }

    /// Refreshes the remote hold so a lease-based service keeps it alive.
    /// Does nothing unless some local holder owns the lock.
    pub async fn renew(&self) -> AppResult<bool> {
        if !self.is_held() {
            return Ok(false);
        }
        let renewed = self.locking.renew(self.namespace.as_str()).await?;
        if !renewed {
            warn!(namespace = %self.namespace, "Remote hold vanished before renewal");
        }
        Ok(renewed)
    }

    pub fn hold_count(&self) -> usize {
        self.state().depth
    }

    pub fn is_held(&self) -> bool {
        self.state().depth > 0
    }

    pub fn is_held_by(&self, holder: HolderId) -> bool {
        let state = self.state();
        state.owner == Some(holder) && state.depth > 0
    }

    pub fn is_held_by_current(&self) -> bool {
        self.is_held_by(HolderId::current())
    }
}
