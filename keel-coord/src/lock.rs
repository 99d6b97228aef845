//! Distributed mutual exclusion over ephemeral-sequential candidates.
//!
//! The holder is the candidate with the smallest live sequence under the lock
//! path. Waiters queue in sequence order and each watches only its immediate
//! predecessor, so a release wakes exactly one waiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{CandidateHandle, SequentialCoordinator};
use crate::error::LockError;
use crate::session::SessionManager;

/// Node name prefix for lock candidates.
pub const LOCK_PREFIX: &str = "lock-";

/// How [`DistributedLock::acquire`] waits.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Wait for the lock instead of returning `Pending`.
    pub blocking: bool,
    /// Give up waiting after this long. Only meaningful when blocking.
    pub timeout: Option<Duration>,
    /// Stop waiting when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    #[must_use]
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn non_blocking() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    candidate: CandidateHandle,
    acquired_at: DateTime<Utc>,
}

impl LockHandle {
    #[must_use]
    pub fn candidate(&self) -> &CandidateHandle {
        &self.candidate
    }

    /// Lock path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.candidate.parent()
    }

    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Outcome of an acquire or wait.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    /// Queued behind another holder; pass to [`DistributedLock::wait`] or
    /// [`DistributedLock::abandon`].
    Pending(CandidateHandle),
    /// Cancelled while waiting. The candidate is still queued.
    Cancelled(CandidateHandle),
}

impl AcquireOutcome {
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// The held lock, if acquired.
    #[must_use]
    pub fn into_handle(self) -> Option<LockHandle> {
        match self {
            Self::Acquired(handle) => Some(handle),
            Self::Pending(_) | Self::Cancelled(_) => None,
        }
    }
}

/// Lock participant.
pub struct DistributedLock {
    coordinator: SequentialCoordinator,
}

impl DistributedLock {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            coordinator: SequentialCoordinator::new(manager, LOCK_PREFIX),
        }
    }

    #[must_use]
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        Self {
            coordinator: self.coordinator.with_identity(identity),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        self.coordinator.identity()
    }

    /// Queue for the lock at `path`.
    pub async fn acquire(
        &self,
        path: &str,
        options: AcquireOptions,
    ) -> Result<AcquireOutcome, LockError> {
        let candidate = self.coordinator.enter(path).await?;
        debug!(path = %candidate.path(), blocking = options.blocking, "Queued for lock");
        self.wait(candidate, options).await
    }

    /// Continue waiting with a queued candidate.
    pub async fn wait(
        &self,
        candidate: CandidateHandle,
        options: AcquireOptions,
    ) -> Result<AcquireOutcome, LockError> {
        if !options.blocking {
            let rank = self.coordinator.rank(&candidate).await?;
            if rank.is_first() {
                return Ok(self.acquired(candidate));
            }
            debug!(
                path = %candidate.path(),
                position = rank.position,
                "Lock held elsewhere"
            );
            return Ok(AcquireOutcome::Pending(candidate));
        }

        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);
        let cancel = options.cancel.unwrap_or_default();

        loop {
            let Some(mut watch) = self.coordinator.watch_predecessor(&candidate).await? else {
                return Ok(self.acquired(candidate));
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(path = %candidate.path(), "Lock wait cancelled");
                    watch.cancel();
                    return Ok(AcquireOutcome::Cancelled(candidate));
                }
                _ = sleep_until(deadline) => {
                    watch.cancel();
                    let waited = started.elapsed();
                    warn!(path = %candidate.path(), ?waited, "Timed out waiting for lock");
                    if let Err(e) = self.coordinator.leave(&candidate).await {
                        debug!(error = %e, "Timed-out candidate already gone");
                    }
                    return Err(LockError::Timeout {
                        path: candidate.parent().to_string(),
                        waited,
                    });
                }
                event = watch.gone() => {
                    debug!(path = %candidate.path(), kind = ?event.kind, "Predecessor changed, re-ranking");
                }
            }
        }
    }

    /// Release a held lock.
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        self.coordinator.leave(&handle.candidate).await?;
        info!(path = %handle.path(), "Lock released");
        Ok(())
    }

    /// Withdraw a queued candidate.
    pub async fn abandon(&self, candidate: CandidateHandle) -> Result<(), LockError> {
        self.coordinator.leave(&candidate).await?;
        debug!(path = %candidate.path(), "Lock candidate abandoned");
        Ok(())
    }

    /// Re-rank and report whether `handle` still holds the lock.
    pub async fn holds(&self, handle: &LockHandle) -> Result<bool, LockError> {
        Ok(self.coordinator.rank(&handle.candidate).await?.is_first())
    }

    fn acquired(&self, candidate: CandidateHandle) -> AcquireOutcome {
        info!(path = %candidate.path(), "Lock acquired");
        AcquireOutcome::Acquired(LockHandle {
            candidate,
            acquired_at: Utc::now(),
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::CoordinatorError;
    use crate::memory::InMemoryStore;
    use crate::watch::WatchKind;

    fn participant(store: &InMemoryStore) -> DistributedLock {
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(100)),
            Arc::new(store.clone()),
        ));
        DistributedLock::new(manager)
    }

    #[tokio::test]
    async fn uncontended_acquire_succeeds() {
        let store = InMemoryStore::new();
        let lock = participant(&store);

        let handle = lock
            .acquire("/locks/a", AcquireOptions::non_blocking())
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        assert_eq!(handle.path(), "/locks/a");
        assert!(lock.holds(&handle).await.unwrap());

        lock.release(handle).await.unwrap();
        assert!(store.children("/locks/a").await.is_empty());
    }

    #[tokio::test]
    async fn non_blocking_returns_pending_when_held() {
        let store = InMemoryStore::new();
        let a = participant(&store);
        let b = participant(&store);

        let held = a
            .acquire("/l", AcquireOptions::non_blocking())
            .await
            .unwrap();
        assert!(held.is_acquired());

        let AcquireOutcome::Pending(candidate) = b
            .acquire("/l", AcquireOptions::non_blocking())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        assert!(store.contains(candidate.path()).await);

        // Pending can be resumed once the holder lets go
        a.release(held.into_handle().unwrap()).await.unwrap();
        let resumed = b
            .wait(candidate, AcquireOptions::non_blocking())
            .await
            .unwrap();
        assert!(resumed.is_acquired());
    }

    #[tokio::test]
    async fn abandon_removes_pending_candidate() {
        let store = InMemoryStore::new();
        let a = participant(&store);
        let b = participant(&store);

        a.acquire("/l", AcquireOptions::non_blocking()).await.unwrap();
        let AcquireOutcome::Pending(candidate) = b
            .acquire("/l", AcquireOptions::non_blocking())
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };

        b.abandon(candidate.clone()).await.unwrap();
        assert!(!store.contains(candidate.path()).await);
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let store = InMemoryStore::new();
        let a = Arc::new(participant(&store));
        let b = Arc::new(participant(&store));

        let held = a
            .acquire("/l", AcquireOptions::blocking())
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.acquire("/l", AcquireOptions::blocking()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.release(held).await.unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.is_acquired());
    }

    #[tokio::test]
    async fn timed_out_candidate_leaves_queue() {
        let store = InMemoryStore::new();
        let a = participant(&store);
        let b = participant(&store);

        a.acquire("/l", AcquireOptions::blocking()).await.unwrap();

        let err = b
            .acquire(
                "/l",
                AcquireOptions::blocking().with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();

        match err {
            LockError::Timeout { path, waited } => {
                assert_eq!(path, "/l");
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.children("/l").await.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_keeps_candidate() {
        let store = InMemoryStore::new();
        let a = participant(&store);
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(100)),
            Arc::new(store.clone()),
        ));
        let b = Arc::new(DistributedLock::new(Arc::clone(&manager)));

        let held = a
            .acquire("/l", AcquireOptions::blocking())
            .await
            .unwrap()
            .into_handle()
            .unwrap();
        let predecessor = held.candidate().path().to_string();

        let cancel = CancellationToken::new();
        let waiter = {
            let b = Arc::clone(&b);
            let options = AcquireOptions::blocking().with_cancel(cancel.clone());
            tokio::spawn(async move { b.acquire("/l", options).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let session = manager.ensure_connected().await.unwrap();
        assert_eq!(
            session.dispatcher().pending(&predecessor, WatchKind::Existence),
            1
        );

        cancel.cancel();
        let AcquireOutcome::Cancelled(candidate) = waiter.await.unwrap().unwrap() else {
            panic!("expected cancelled");
        };
        assert!(store.contains(candidate.path()).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            session.dispatcher().pending(&predecessor, WatchKind::Existence),
            0
        );
    }

    #[tokio::test]
    async fn holder_expiry_hands_lock_to_next() {
        let store = InMemoryStore::new();
        let a = participant(&store);
        let b = Arc::new(participant(&store));

        let held = a
            .acquire("/l", AcquireOptions::blocking())
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.acquire("/l", AcquireOptions::blocking()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.expire_session(held.candidate().session_id()).await;
        assert!(waiter.await.unwrap().unwrap().is_acquired());

        // The old holder learns it lost the lock on its next check
        assert!(matches!(
            a.holds(&held).await,
            Err(LockError::Coordinator(CoordinatorError::SessionLost))
        ));
    }
}
