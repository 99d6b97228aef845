//! In-memory store for testing and the embedded demo endpoint.
//!
//! Implements the full store contract in process: ephemeral-sequential
//! suffixes, ephemeral cleanup when a session ends, one-shot watches and
//! per-session ordering. Sessions never expire on their own; tests drive
//! expiry and partitions through the methods on [`InMemoryStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::traits::{
    Connector, CreateMode, EventKind, NodeMeta, SessionId, SessionState, Store, StoreResult,
    WatchSender, WatchedEvent, parent_path, validate_path,
};

/// Endpoint scheme served by [`InMemoryStore`].
pub const MEMORY_SCHEME: &str = "mem://";

struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    next_sequence: u64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_sequence: 0,
            created_at: now,
            modified_at: now,
        }
    }
}

/// A session that has not ended. Ended sessions are removed; their
/// receivers keep the final state.
struct SessionEntry {
    state: watch::Sender<SessionState>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, SessionEntry>,
    /// Existence/data watches by node path.
    data_watches: HashMap<String, Vec<(SessionId, WatchSender)>>,
    /// Child watches by parent path.
    child_watches: HashMap<String, Vec<(SessionId, WatchSender)>>,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        tree
    }

    fn check_live(
        &self,
        session: SessionId,
        last: &watch::Receiver<SessionState>,
    ) -> StoreResult<()> {
        let Some(entry) = self.sessions.get(&session) else {
            return Err(match *last.borrow() {
                SessionState::Expired => StoreError::SessionExpired,
                _ => StoreError::SessionClosed,
            });
        };
        match *entry.state.borrow() {
            SessionState::Connected => Ok(()),
            SessionState::Expired => Err(StoreError::SessionExpired),
            SessionState::Failed => Err(StoreError::SessionClosed),
            SessionState::Disconnected | SessionState::Connecting => {
                Err(StoreError::ConnectionLoss)
            }
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn meta(&self, path: &str, node: &Node) -> NodeMeta {
        NodeMeta {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.child_names(path).len(),
            data_length: node.data.len(),
            created_at: node.created_at,
            modified_at: node.modified_at,
        }
    }

    fn fire(
        watches: &mut HashMap<String, Vec<(SessionId, WatchSender)>>,
        path: &str,
        kind: EventKind,
    ) {
        if let Some(pending) = watches.remove(path) {
            trace!(path, ?kind, count = pending.len(), "Firing watches");
            for (_, tx) in pending {
                // Receiver may have been cancelled
                let _ = tx.send(WatchedEvent::node(path, kind));
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        Self::fire(&mut self.data_watches, path, EventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, path, EventKind::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            Self::fire(
                &mut self.child_watches,
                parent,
                EventKind::NodeChildrenChanged,
            );
        }
    }

    /// End a session: drop its watches, then its ephemeral nodes.
    fn end_session(&mut self, session: SessionId, state: SessionState) {
        if let Some(entry) = self.sessions.remove(&session) {
            entry.state.send_replace(state);
        }

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for pending in watches.values_mut() {
                pending.retain(|(owner, _)| *owner != session);
            }
            watches.retain(|_, pending| !pending.is_empty());
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            debug!(path = %path, session_id = session, "Removing ephemeral node");
            self.remove_node(&path);
        }
    }
}

/// In-memory hierarchical store.
///
/// Cloning shares the same tree, so one store can serve many sessions.
#[derive(Clone)]
pub struct InMemoryStore {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
    stalled_connects: Arc<AtomicU32>,
}

impl InMemoryStore {
    /// Create an empty store containing only the root node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            next_session: Arc::new(AtomicU64::new(1)),
            stalled_connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The next `count` sessions stay in `Connecting` and never connect.
    pub fn stall_connects(&self, count: u32) {
        self.stalled_connects.store(count, Ordering::SeqCst);
    }

    /// Expire a session as the store would after its timeout elapses.
    pub async fn expire_session(&self, session: SessionId) {
        let mut tree = self.tree.lock().await;
        if tree.sessions.contains_key(&session) {
            debug!(session_id = session, "Expiring session");
            tree.end_session(session, SessionState::Expired);
        }
    }

    /// Simulate a transient connection loss for a session.
    pub async fn partition_session(&self, session: SessionId) {
        self.set_state(session, SessionState::Disconnected).await;
    }

    /// Restore a partitioned session.
    pub async fn heal_session(&self, session: SessionId) {
        self.set_state(session, SessionState::Connected).await;
    }

    async fn set_state(&self, session: SessionId, state: SessionState) {
        let tree = self.tree.lock().await;
        if let Some(entry) = tree.sessions.get(&session) {
            entry.state.send_replace(state);
        }
    }

    /// Whether a node exists, bypassing sessions.
    pub async fn contains(&self, path: &str) -> bool {
        self.tree.lock().await.nodes.contains_key(path)
    }

    /// Child names of a node, sorted, bypassing sessions.
    pub async fn children(&self, path: &str) -> Vec<String> {
        let mut names = self.tree.lock().await.child_names(path);
        names.sort();
        names
    }

    /// Number of sessions that have not ended.
    pub async fn live_sessions(&self) -> usize {
        self.tree.lock().await.sessions.len()
    }

    /// Number of pending watches on a node path.
    pub async fn watch_count(&self, path: &str) -> usize {
        let tree = self.tree.lock().await;
        tree.data_watches.get(path).map_or(0, Vec::len)
            + tree.child_watches.get(path).map_or(0, Vec::len)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryStore {
    async fn connect(
        &self,
        endpoint: &str,
        session_timeout: Duration,
    ) -> StoreResult<Arc<dyn Store>> {
        if !endpoint.starts_with(MEMORY_SCHEME) {
            return Err(StoreError::UnsupportedEndpoint(endpoint.to_string()));
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let stalled = self
            .stalled_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let initial = if stalled {
            SessionState::Connecting
        } else {
            SessionState::Connected
        };

        let (state_tx, state_rx) = watch::channel(initial);
        self.tree.lock().await.sessions.insert(
            id,
            SessionEntry { state: state_tx },
        );

        debug!(
            session_id = id,
            endpoint,
            timeout_ms = session_timeout.as_millis() as u64,
            stalled,
            "Opened in-memory session"
        );

        Ok(Arc::new(MemorySession {
            id,
            tree: Arc::clone(&self.tree),
            state: state_rx,
        }))
    }
}

/// A session on an [`InMemoryStore`].
pub struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
    state: watch::Receiver<SessionState>,
}

#[async_trait]
impl Store for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        validate_path(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        let parent = parent_path(path).ok_or(StoreError::AlreadyExists(path.to_string()))?;
        let parent_node = tree
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NoParent(path.to_string()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent.to_string()));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if tree.nodes.contains_key(&actual) {
            return Err(StoreError::AlreadyExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(self.id);
        tree.nodes
            .insert(actual.clone(), Node::new(data.to_vec(), owner));
        Tree::fire(&mut tree.data_watches, &actual, EventKind::NodeCreated);
        Tree::fire(
            &mut tree.child_watches,
            parent,
            EventKind::NodeChildrenChanged,
        );

        trace!(path = %actual, ?mode, session_id = self.id, "Created node");
        Ok(actual)
    }

    async fn exists(
        &self,
        path: &str,
        watch: Option<WatchSender>,
    ) -> StoreResult<Option<NodeMeta>> {
        validate_path(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        let meta = tree.nodes.get(path).map(|node| tree.meta(path, node));
        if let Some(tx) = watch {
            tree.data_watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, tx));
        }
        Ok(meta)
    }

    async fn get_data(&self, path: &str) -> StoreResult<(Vec<u8>, NodeMeta)> {
        validate_path(path)?;
        let tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok((node.data.clone(), tree.meta(path, node)))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> StoreResult<NodeMeta> {
        validate_path(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        node.modified_at = Utc::now();

        Tree::fire(&mut tree.data_watches, path, EventKind::NodeDataChanged);
        let node = &tree.nodes[path];
        Ok(tree.meta(path, node))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        if !tree.child_names(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        tree.remove_node(path);
        trace!(path, session_id = self.id, "Deleted node");
        Ok(())
    }

    async fn list_children(
        &self,
        path: &str,
        watch: Option<WatchSender>,
    ) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_live(self.id, &self.state)?;

        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let names = tree.child_names(path);
        if let Some(tx) = watch {
            tree.child_watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, tx));
        }
        Ok(names)
    }

    async fn close(&self) -> StoreResult<()> {
        let mut tree = self.tree.lock().await;
        if !tree.sessions.contains_key(&self.id) {
            return Ok(());
        }
        debug!(session_id = self.id, "Closing in-memory session");
        tree.end_session(self.id, SessionState::Disconnected);
        Ok(())
    }
}
