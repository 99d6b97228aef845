//! Ephemeral-sequential candidates: the primitive under election and locking.
//!
//! A candidate is an ephemeral-sequential child of a parent path. Its rank is
//! its index among live siblings sorted by sequence suffix; rank 0 holds the
//! election or the lock. Waiters watch only their immediate predecessor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordinatorError, StoreError};
use crate::session::{Session, SessionManager};
use crate::traits::{
    CreateMode, EventKind, SessionId, Store, WatchedEvent, join_path, node_name,
    sequence_suffix, validate_path,
};
use crate::watch::{PendingWatch, WatchKey};

/// A live candidate node owned by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateHandle {
    parent: String,
    name: String,
    path: String,
    sequence: String,
    session_id: SessionId,
    created_at: DateTime<Utc>,
}

impl CandidateHandle {
    /// Parent (election or lock) path.
    #[must_use]
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Node name, e.g. `lock-0000000003`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full node path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store-assigned sequence suffix.
    #[must_use]
    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// Session that owns the node.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Creation time recorded by the store.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Position of a candidate among its live siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rank {
    /// 0 means the smallest sequence among live siblings.
    pub position: usize,
    /// Sibling names sorted by sequence suffix.
    pub siblings: Vec<String>,
}

impl Rank {
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.position == 0
    }

    /// Sibling immediately ahead of this candidate.
    #[must_use]
    pub fn predecessor(&self) -> Option<&str> {
        self.position
            .checked_sub(1)
            .and_then(|idx| self.siblings.get(idx))
            .map(String::as_str)
    }
}

/// One-shot watch on a candidate's immediate predecessor.
#[derive(Debug)]
pub struct PredecessorWatch {
    predecessor: String,
    pending: PendingWatch,
}

impl PredecessorWatch {
    /// Full path of the watched predecessor.
    #[must_use]
    pub fn predecessor(&self) -> &str {
        &self.predecessor
    }

    /// Wait until the predecessor changes. Re-rank afterwards: the fire
    /// only says something changed. Resolves at most once.
    pub async fn gone(&mut self) -> WatchedEvent {
        self.pending.fired().await
    }

    /// Deregister the watch.
    pub fn cancel(self) {
        self.pending.cancel();
    }
}

struct Entered {
    path: String,
    session_id: SessionId,
}

/// Creates and ranks candidates for one participant identity.
pub struct SequentialCoordinator {
    manager: Arc<SessionManager>,
    prefix: String,
    identity: String,
    /// Outstanding candidate per parent; also serializes `enter`.
    entered: Mutex<HashMap<String, Entered>>,
}

impl SequentialCoordinator {
    /// Create a coordinator naming its candidates `<prefix><sequence>`.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
            identity: Uuid::new_v4().to_string(),
            entered: Mutex::new(HashMap::new()),
        }
    }

    /// Use a fixed identity, stored as candidate node data.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Create this participant's candidate under `parent`.
    ///
    /// Fails with [`CoordinatorError::AlreadyEntered`] if a candidate from the
    /// current session is still outstanding under the same parent.
    pub async fn enter(&self, parent: &str) -> Result<CandidateHandle, CoordinatorError> {
        validate_path(parent).map_err(|e| CoordinatorError::from_store(parent, e))?;

        let mut entered = self.entered.lock().await;
        let session = self.manager.ensure_connected().await?;

        if let Some(existing) = entered.get(parent) {
            if existing.session_id == session.id() {
                return Err(CoordinatorError::AlreadyEntered {
                    parent: parent.to_string(),
                    candidate: existing.path.clone(),
                });
            }
            debug!(
                parent,
                stale = %existing.path,
                "Dropping candidate from a lost session"
            );
        }

        ensure_path(session.store().as_ref(), parent).await?;

        let path = session
            .store()
            .create(
                &join_path(parent, &self.prefix),
                self.identity.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await
            .map_err(|e| CoordinatorError::from_store(parent, e))?;

        let name = node_name(&path).to_string();
        let sequence = sequence_suffix(&name)
            .ok_or_else(|| CoordinatorError::Rejected {
                path: path.clone(),
                reason: "store returned a node without a sequence suffix".to_string(),
            })?
            .to_string();

        let created_at = match session.store().exists(&path, None).await {
            Ok(Some(meta)) => meta.created_at,
            // An ephemeral node gone right after creation: its session ended
            Ok(None) => return Err(CoordinatorError::SessionLost),
            Err(e) => {
                if let Err(cleanup) = session.store().delete(&path, None).await {
                    debug!(path = %path, error = %cleanup, "Could not remove unread candidate");
                }
                return Err(CoordinatorError::from_store(&path, e));
            }
        };

        entered.insert(
            parent.to_string(),
            Entered {
                path: path.clone(),
                session_id: session.id(),
            },
        );

        info!(path = %path, session_id = session.id(), "Entered as candidate");
        Ok(CandidateHandle {
            parent: parent.to_string(),
            name,
            path,
            sequence,
            session_id: session.id(),
            created_at,
        })
    }

    /// List live siblings and locate this candidate among them.
    pub async fn rank(&self, handle: &CandidateHandle) -> Result<Rank, CoordinatorError> {
        let session = self.live_session(handle).await?;
        self.rank_in(&session, handle).await
    }

    /// Arm a one-shot watch on the immediate predecessor.
    ///
    /// Returns `None` when the candidate is first. If the predecessor vanished
    /// between listing and arming, the returned watch has already fired.
    pub async fn watch_predecessor(
        &self,
        handle: &CandidateHandle,
    ) -> Result<Option<PredecessorWatch>, CoordinatorError> {
        let session = self.live_session(handle).await?;
        let rank = self.rank_in(&session, handle).await?;

        let Some(predecessor) = rank.predecessor() else {
            return Ok(None);
        };
        let predecessor = join_path(&handle.parent, predecessor);

        let (meta, pending) = session
            .dispatcher()
            .register_existence(&predecessor)
            .await?;

        let pending = if meta.is_some() {
            debug!(path = %handle.path, predecessor = %predecessor, "Watching predecessor");
            pending
        } else {
            pending.cancel();
            PendingWatch::ready(
                WatchKey::existence(&predecessor),
                WatchedEvent::node(&predecessor, EventKind::NodeDeleted),
            )
        };

        Ok(Some(PredecessorWatch {
            predecessor,
            pending,
        }))
    }

    /// Delete the candidate and clear the entry guard.
    ///
    /// Fails with `SessionLost` if the owning session is gone; the store has
    /// already removed the node in that case.
    pub async fn leave(&self, handle: &CandidateHandle) -> Result<(), CoordinatorError> {
        {
            let mut entered = self.entered.lock().await;
            if entered
                .get(&handle.parent)
                .is_some_and(|e| e.path == handle.path)
            {
                entered.remove(&handle.parent);
            }
        }

        let session = self.live_session(handle).await?;
        match session.store().delete(&handle.path, None).await {
            Ok(()) => {
                info!(path = %handle.path, "Left candidacy");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                debug!(path = %handle.path, "Candidate already removed");
                Ok(())
            }
            Err(e) => Err(CoordinatorError::from_store(&handle.path, e)),
        }
    }

    async fn live_session(&self, handle: &CandidateHandle) -> Result<Session, CoordinatorError> {
        let session = self.manager.ensure_connected().await?;
        if session.id() != handle.session_id {
            warn!(
                path = %handle.path,
                owner = handle.session_id,
                current = session.id(),
                "Candidate belongs to a lost session"
            );
            return Err(CoordinatorError::SessionLost);
        }
        Ok(session)
    }

    async fn rank_in(
        &self,
        session: &Session,
        handle: &CandidateHandle,
    ) -> Result<Rank, CoordinatorError> {
        let children = session
            .store()
            .list_children(&handle.parent, None)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => CoordinatorError::SessionLost,
                other => CoordinatorError::from_store(&handle.parent, other),
            })?;

        let siblings = sort_by_sequence(children);
        let position = siblings
            .iter()
            .position(|name| *name == handle.name)
            .ok_or_else(|| {
                warn!(path = %handle.path, "Candidate missing from sibling list");
                CoordinatorError::SessionLost
            })?;

        Ok(Rank { position, siblings })
    }
}

/// Sort sequential children by suffix, dropping names without one.
#[must_use]
pub fn sort_by_sequence(children: Vec<String>) -> Vec<String> {
    let mut siblings: Vec<String> = children
        .into_iter()
        .filter(|name| sequence_suffix(name).is_some())
        .collect();
    siblings.sort_by(|a, b| sequence_suffix(a).cmp(&sequence_suffix(b)).then(a.cmp(b)));
    siblings
}

/// Create `path` and any missing ancestors as persistent nodes.
pub(crate) async fn ensure_path(store: &dyn Store, path: &str) -> Result<(), CoordinatorError> {
    if path == "/" {
        return Ok(());
    }
    match store.exists(path, None).await {
        Ok(Some(_)) => return Ok(()),
        Ok(None) => {}
        Err(e) => return Err(CoordinatorError::from_store(path, e)),
    }

    let mut current = String::new();
    for segment in path[1..].split('/') {
        current.push('/');
        current.push_str(segment);
        match store.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) => debug!(path = %current, "Created parent node"),
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(CoordinatorError::from_store(&current, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::InMemoryStore;

    fn manager(store: &InMemoryStore) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(100)),
            Arc::new(store.clone()),
        ))
    }

    #[tokio::test]
    async fn enter_creates_parents_and_candidate() {
        let store = InMemoryStore::new();
        let coordinator = SequentialCoordinator::new(manager(&store), "candidate-");

        let handle = coordinator.enter("/app/election").await.unwrap();

        assert!(store.contains("/app").await);
        assert_eq!(handle.parent(), "/app/election");
        assert_eq!(handle.name(), "candidate-0000000000");
        assert_eq!(handle.sequence(), "0000000000");
        assert_eq!(handle.path(), "/app/election/candidate-0000000000");
    }

    #[tokio::test]
    async fn candidate_carries_store_creation_time() {
        let store = InMemoryStore::new();
        let manager = manager(&store);
        let coordinator = SequentialCoordinator::new(Arc::clone(&manager), "c-");

        let handle = coordinator.enter("/ts").await.unwrap();
        let session = manager.ensure_connected().await.unwrap();
        let meta = session
            .store()
            .exists(handle.path(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.created_at(), meta.created_at);
    }

    #[tokio::test]
    async fn enter_tolerates_existing_parent() {
        let store = InMemoryStore::new();
        let first = SequentialCoordinator::new(manager(&store), "c-");
        let second = SequentialCoordinator::new(manager(&store), "c-");

        first.enter("/shared").await.unwrap();
        let handle = second.enter("/shared").await.unwrap();
        assert_eq!(handle.sequence(), "0000000001");
    }

    #[tokio::test]
    async fn double_enter_is_rejected() {
        let store = InMemoryStore::new();
        let coordinator = SequentialCoordinator::new(manager(&store), "c-");

        let handle = coordinator.enter("/e").await.unwrap();
        let err = coordinator.enter("/e").await.unwrap_err();

        assert_eq!(
            err,
            CoordinatorError::AlreadyEntered {
                parent: "/e".to_string(),
                candidate: handle.path().to_string(),
            }
        );
        assert_eq!(store.children("/e").await.len(), 1);
    }

    #[tokio::test]
    async fn enter_again_after_leave() {
        let store = InMemoryStore::new();
        let coordinator = SequentialCoordinator::new(manager(&store), "c-");

        let first = coordinator.enter("/e").await.unwrap();
        coordinator.leave(&first).await.unwrap();
        let second = coordinator.enter("/e").await.unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(store.children("/e").await, vec![second.name().to_string()]);
    }

    #[tokio::test]
    async fn concurrent_enters_serialize_to_one_candidate() {
        let store = InMemoryStore::new();
        let coordinator = Arc::new(SequentialCoordinator::new(manager(&store), "c-"));

        let a = Arc::clone(&coordinator);
        let b = Arc::clone(&coordinator);
        let (ra, rb) = tokio::join!(
            async move { a.enter("/race").await },
            async move { b.enter("/race").await },
        );

        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(store.children("/race").await.len(), 1);
    }

    #[tokio::test]
    async fn rank_orders_by_sequence() {
        let store = InMemoryStore::new();
        let first = SequentialCoordinator::new(manager(&store), "c-");
        let second = SequentialCoordinator::new(manager(&store), "c-");

        let h1 = first.enter("/rank").await.unwrap();
        let h2 = second.enter("/rank").await.unwrap();

        let r1 = first.rank(&h1).await.unwrap();
        let r2 = second.rank(&h2).await.unwrap();

        assert!(r1.is_first());
        assert_eq!(r1.predecessor(), None);
        assert_eq!(r2.position, 1);
        assert_eq!(r2.predecessor(), Some(h1.name()));
        assert_eq!(r1.siblings, r2.siblings);
    }

    #[tokio::test]
    async fn watch_predecessor_fires_when_predecessor_leaves() {
        let store = InMemoryStore::new();
        let first = SequentialCoordinator::new(manager(&store), "c-");
        let second = SequentialCoordinator::new(manager(&store), "c-");

        let h1 = first.enter("/w").await.unwrap();
        let h2 = second.enter("/w").await.unwrap();

        assert!(first.watch_predecessor(&h1).await.unwrap().is_none());
        let mut watch = second.watch_predecessor(&h2).await.unwrap().unwrap();
        assert_eq!(watch.predecessor(), h1.path());

        first.leave(&h1).await.unwrap();
        let event = watch.gone().await;
        assert_eq!(event.kind, EventKind::NodeDeleted);
        assert!(second.rank(&h2).await.unwrap().is_first());
    }

    #[tokio::test]
    async fn rank_after_expiry_is_session_lost() {
        let store = InMemoryStore::new();
        let manager = manager(&store);
        let coordinator = SequentialCoordinator::new(Arc::clone(&manager), "c-");

        let handle = coordinator.enter("/x").await.unwrap();
        store.expire_session(handle.session_id()).await;

        assert_eq!(
            coordinator.rank(&handle).await.unwrap_err(),
            CoordinatorError::SessionLost
        );
        assert!(matches!(
            coordinator.watch_predecessor(&handle).await,
            Err(CoordinatorError::SessionLost)
        ));

        let fresh = coordinator.enter("/x").await.unwrap();
        assert_ne!(fresh.path(), handle.path());
        assert_ne!(fresh.session_id(), handle.session_id());
    }

    #[tokio::test]
    async fn long_partition_loses_candidate() {
        let store = InMemoryStore::new();
        let coordinator = SequentialCoordinator::new(
            Arc::new(SessionManager::new(
                SessionConfig::default()
                    .with_connect_timeout(Duration::from_millis(20))
                    .with_max_connect_attempts(1),
                Arc::new(store.clone()),
            )),
            "c-",
        );

        let handle = coordinator.enter("/p").await.unwrap();
        store.partition_session(handle.session_id()).await;

        // The partition outlasts the connect timeout; the manager replaces
        // the session, so the old candidate is lost
        let err = coordinator.rank(&handle).await.unwrap_err();
        assert_eq!(err, CoordinatorError::SessionLost);
    }

    #[test]
    fn sort_by_sequence_ignores_prefix_and_foreign_names() {
        let sorted = sort_by_sequence(vec![
            "b-0000000003".to_string(),
            "config".to_string(),
            "a-0000000007".to_string(),
            "c-0000000001".to_string(),
        ]);
        assert_eq!(
            sorted,
            vec!["c-0000000001", "b-0000000003", "a-0000000007"]
        );
    }

    #[test]
    fn rank_predecessor_is_immediate() {
        let rank = Rank {
            position: 2,
            siblings: vec!["x-1".into(), "x-2".into(), "x-3".into()],
        };
        assert_eq!(rank.predecessor(), Some("x-2"));
    }
}
