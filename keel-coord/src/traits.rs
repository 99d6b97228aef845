//! Contract of the external hierarchical store.
//!
//! The store (ZooKeeper-like) is reached only through [`Connector`] and
//! [`Store`]. Watches are handed to the store as a oneshot sender, so a
//! registration can fire at most once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};

use crate::error::StoreError;

/// Result type for raw store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identifier the store assigns to a session.
pub type SessionId = u64;

/// Sender half of a one-shot watch registration.
pub type WatchSender = oneshot::Sender<WatchedEvent>;

/// Width of store-assigned sequence suffixes.
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the node is removed when its session ends.
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the store appends a sequence suffix to the name.
    #[must_use]
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Metadata of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    /// Data version, incremented on every `set_data`.
    pub version: i32,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
    pub data_length: usize,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// State of a store session as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session, or a transient loss of connection.
    Disconnected,
    /// Session establishment in progress.
    Connecting,
    /// Session is usable.
    Connected,
    /// The store expired the session; ephemerals and watches are gone.
    Expired,
    /// Retries exhausted. Only the session manager reports this.
    Failed,
}

impl SessionState {
    /// Whether a watch registered under this session can still fire.
    #[must_use]
    pub fn can_honor_watches(self) -> bool {
        matches!(self, Self::Connected | Self::Disconnected | Self::Connecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of change a watch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// Synthetic: the session changed such that the watch can't be honored.
    SessionChanged,
}

/// A fired watch. Carries no node state; re-query the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub path: String,
    pub kind: EventKind,
    pub session_state: Option<SessionState>,
}

impl WatchedEvent {
    pub fn node(path: impl Into<String>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            session_state: None,
        }
    }

    pub fn session_changed(path: impl Into<String>, state: SessionState) -> Self {
        Self {
            path: path.into(),
            kind: EventKind::SessionChanged,
            session_state: Some(state),
        }
    }
}

/// One live session against the store.
///
/// Operations issued on the same session are applied in issue order.
#[async_trait]
pub trait Store: Send + Sync {
    /// Session identifier assigned by the store.
    fn session_id(&self) -> SessionId;

    /// Session state stream.
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Create a node, returning its full path (with suffix when sequential).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String>;

    /// Stat a node. A watch is armed whether or not the node exists.
    async fn exists(&self, path: &str, watch: Option<WatchSender>)
    -> StoreResult<Option<NodeMeta>>;

    async fn get_data(&self, path: &str) -> StoreResult<(Vec<u8>, NodeMeta)>;

    /// Replace a node's data; `version` enforces a compare-and-set.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>)
    -> StoreResult<NodeMeta>;

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()>;

    /// Child names (not full paths), in no particular order.
    async fn list_children(&self, path: &str, watch: Option<WatchSender>)
    -> StoreResult<Vec<String>>;

    /// End the session; the store removes its ephemeral nodes.
    async fn close(&self) -> StoreResult<()>;
}

/// Opens sessions against a store endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Begin establishing a session. The returned store may still be
    /// `Connecting`; callers wait on [`Store::state`].
    async fn connect(&self, endpoint: &str, session_timeout: Duration)
    -> StoreResult<Arc<dyn Store>>;
}

/// Join a parent path and a child name.
#[must_use]
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path, `None` for the root.
#[must_use]
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a path.
#[must_use]
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Store-assigned sequence suffix of a sequential node name.
#[must_use]
pub fn sequence_suffix(name: &str) -> Option<&str> {
    let suffix = name.get(name.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    suffix.bytes().all(|b| b.is_ascii_digit()).then_some(suffix)
}

/// Validate an absolute node path.
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split_paths() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/lock-0000000003"), "lock-0000000003");
    }

    #[test]
    fn sequence_suffix_requires_fixed_width_digits() {
        assert_eq!(sequence_suffix("lock-0000000042"), Some("0000000042"));
        assert_eq!(sequence_suffix("0000000001"), Some("0000000001"));
        assert_eq!(sequence_suffix("lock-42"), None);
        assert_eq!(sequence_suffix("candidate-00000000x1"), None);
    }

    #[test]
    fn lexicographic_order_matches_numeric_for_suffixes() {
        let mut names = vec![
            format!("c-{:010}", 10),
            format!("c-{:010}", 9),
            format!("c-{:010}", 100),
        ];
        names.sort();
        assert_eq!(names[0], "c-0000000009");
        assert_eq!(names[2], "c-0000000100");
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[test]
    fn create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(SessionState::Expired.to_string(), "expired");
        assert_eq!(SessionState::Failed.to_string(), "failed");
    }

    #[test]
    fn expired_session_cannot_honor_watches() {
        assert!(SessionState::Connected.can_honor_watches());
        assert!(!SessionState::Expired.can_honor_watches());
        assert!(!SessionState::Failed.can_honor_watches());
    }
}
