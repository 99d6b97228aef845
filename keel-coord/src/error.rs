//! Error types for keel-coord.
//!
//! Each component owns its error kind. Store errors are translated at the
//! component boundary so callers reason about sessions, candidates and locks
//! rather than raw node results.

use std::time::Duration;

use thiserror::Error;

use crate::traits::SessionState;

/// Top-level error type for keel-coord
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

/// Result type alias for keel-coord operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`Store`](crate::traits::Store) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Parent node does not exist for {0}")]
    NoParent(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to the store was lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session closed")]
    SessionClosed,

    #[error("No store backend for endpoint: {0}")]
    UnsupportedEndpoint(String),
}

/// Errors from establishing a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Timed out after {timeout:?} waiting for session to reach {wanted}")]
    Timeout {
        wanted: SessionState,
        timeout: Duration,
    },

    #[error("Store refused session: {0}")]
    Refused(#[from] StoreError),

    #[error("Failed to connect to {endpoint} after {attempts} attempts")]
    ExhaustedRetries { endpoint: String, attempts: u32 },
}

/// Errors from the sequential node coordinator and the protocols built on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Session lost; re-enter after reconnecting")]
    SessionLost,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Already entered {parent} with candidate {candidate}")]
    AlreadyEntered { parent: String, candidate: String },

    #[error("Store rejected operation on {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl CoordinatorError {
    /// Whether the caller should reconnect and re-run the whole operation.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionLost)
    }

    pub(crate) fn from_store(path: &str, err: StoreError) -> Self {
        match err {
            StoreError::SessionExpired | StoreError::SessionClosed => Self::SessionLost,
            StoreError::ConnectionLoss | StoreError::UnsupportedEndpoint(_) => {
                Self::StoreUnavailable(err.to_string())
            }
            other => Self::Rejected {
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from the distributed lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: String, waited: Duration },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl From<ConnectionError> for LockError {
    fn from(err: ConnectionError) -> Self {
        Self::Coordinator(err.into())
    }
}

/// Errors from plain node operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl NodeError {
    pub(crate) fn from_store(path: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(p) => Self::NotFound(p),
            StoreError::AlreadyExists(p) => Self::AlreadyExists(p),
            StoreError::VersionConflict {
                path,
                expected,
                actual,
            } => Self::VersionConflict {
                path,
                expected,
                actual,
            },
            other => Self::Coordinator(CoordinatorError::from_store(path, other)),
        }
    }
}

impl From<ConnectionError> for NodeError {
    fn from(err: ConnectionError) -> Self {
        Self::Coordinator(err.into())
    }
}
