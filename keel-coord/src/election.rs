//! Leader election over ephemeral-sequential candidates.
//!
//! The candidate with the smallest live sequence under the election path is
//! the leader. Followers watch their immediate predecessor and re-rank when
//! it fires; a fire alone never grants leadership. Leadership ends when the
//! candidate node goes away, by [`LeaderElection::resign`] or by the session
//! ending.
//!
//! # Example
//!
//! ```ignore
//! let election = LeaderElection::new(manager);
//! match election.try_elect("/leader-election").await? {
//!     ElectionResult::Leader(handle) => run_as_leader(handle).await,
//!     ElectionResult::Follower(handle, _watch) => {
//!         let cancel = CancellationToken::new();
//!         election.wait_for_leadership(handle, &cancel).await?;
//!     }
//! }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::{CandidateHandle, PredecessorWatch, SequentialCoordinator};
use crate::error::{CoordinatorError, StoreError};
use crate::session::SessionManager;
use crate::traits::{WatchedEvent, join_path};

/// Node name prefix for election candidates.
pub const CANDIDATE_PREFIX: &str = "candidate-";

/// Outcome of [`LeaderElection::try_elect`].
#[derive(Debug)]
pub enum ElectionResult {
    /// This candidate has the smallest sequence.
    Leader(CandidateHandle),
    /// Another candidate is ahead; the watch fires when the predecessor
    /// changes.
    Follower(CandidateHandle, LeadershipWatch),
}

impl ElectionResult {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }

    #[must_use]
    pub fn handle(&self) -> &CandidateHandle {
        match self {
            Self::Leader(handle) | Self::Follower(handle, _) => handle,
        }
    }
}

/// Change notification for a follower.
#[derive(Debug)]
pub struct LeadershipWatch {
    inner: PredecessorWatch,
}

impl LeadershipWatch {
    /// Candidate this follower is waiting behind.
    #[must_use]
    pub fn predecessor(&self) -> &str {
        self.inner.predecessor()
    }

    /// Resolve when the predecessor changes. Call
    /// [`LeaderElection::is_leader`] afterwards. Later calls stay pending
    /// until a new watch is taken with [`LeaderElection::watch`].
    pub async fn changed(&mut self) -> WatchedEvent {
        self.inner.gone().await
    }
}

/// Outcome of [`LeaderElection::wait_for_leadership`].
#[derive(Debug)]
pub enum LeadershipWait {
    Leader(CandidateHandle),
    /// Cancelled by the caller. The candidate node is still live.
    Cancelled(CandidateHandle),
}

/// Current leader as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    /// Leader's candidate node name.
    pub candidate: String,
    /// Identity the leader stored in its node.
    pub identity: String,
}

/// Leader election participant.
pub struct LeaderElection {
    coordinator: SequentialCoordinator,
}

impl LeaderElection {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            coordinator: SequentialCoordinator::new(manager, CANDIDATE_PREFIX),
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

    /// Enter the election at `path` and report whether this candidate leads.
    pub async fn try_elect(&self, path: &str) -> Result<ElectionResult, CoordinatorError> {
        let handle = self.coordinator.enter(path).await?;

        match self.coordinator.watch_predecessor(&handle).await? {
            None => {
                info!(path = %handle.path(), "Elected leader");
                Ok(ElectionResult::Leader(handle))
            }
            Some(watch) => {
                info!(
                    path = %handle.path(),
                    predecessor = %watch.predecessor(),
                    "Following"
                );
                Ok(ElectionResult::Follower(
                    handle,
                    LeadershipWatch { inner: watch },
                ))
            }
        }
    }

    /// Re-rank and report whether `handle` currently leads.
    pub async fn is_leader(&self, handle: &CandidateHandle) -> Result<bool, CoordinatorError> {
        Ok(self.coordinator.rank(handle).await?.is_first())
    }

    /// Re-arm the follower watch. `None` means `handle` now leads.
    pub async fn watch(
        &self,
        handle: &CandidateHandle,
    ) -> Result<Option<LeadershipWatch>, CoordinatorError> {
        Ok(self
            .coordinator
            .watch_predecessor(handle)
            .await?
            .map(|inner| LeadershipWatch { inner }))
    }

    /// Wait until `handle` leads, re-ranking after every predecessor change.
    ///
    /// Fails with `SessionLost` if the session ends while waiting.
    pub async fn wait_for_leadership(
        &self,
        handle: CandidateHandle,
        cancel: &CancellationToken,
    ) -> Result<LeadershipWait, CoordinatorError> {
        loop {
            let Some(mut watch) = self.coordinator.watch_predecessor(&handle).await? else {
                info!(path = %handle.path(), "Elected leader");
                return Ok(LeadershipWait::Leader(handle));
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(path = %handle.path(), "Leadership wait cancelled");
                    watch.cancel();
                    return Ok(LeadershipWait::Cancelled(handle));
                }
                event = watch.gone() => {
                    debug!(path = %handle.path(), kind = ?event.kind, "Predecessor changed, re-ranking");
                }
            }
        }
    }

    /// Read the current leader, if any.
    pub async fn current_leader(&self, path: &str) -> Result<Option<LeaderInfo>, CoordinatorError> {
        let session = self.coordinator.manager().ensure_connected().await?;
        let store = session.store();

        // The leader may leave between listing and reading; retry on that race
        loop {
            let children = match store.list_children(path, None).await {
                Ok(children) => children,
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(CoordinatorError::from_store(path, e)),
            };
            let Some(first) = crate::coordinator::sort_by_sequence(children)
                .into_iter()
                .next()
            else {
                return Ok(None);
            };

            match store.get_data(&join_path(path, &first)).await {
                Ok((data, _)) => {
                    return Ok(Some(LeaderInfo {
                        candidate: first,
                        identity: String::from_utf8_lossy(&data).into_owned(),
                    }));
                }
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(CoordinatorError::from_store(path, e)),
            }
        }
    }

    /// Step down by deleting the candidate node.
    pub async fn resign(&self, handle: &CandidateHandle) -> Result<(), CoordinatorError> {
        self.coordinator.leave(handle).await
    }
}
