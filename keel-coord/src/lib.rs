//! Client-side coordination over a hierarchical watch store.
//!
//! This crate provides resilient session management, leader election and
//! distributed locking on top of a strongly consistent key-node store with
//! ephemeral-sequential nodes and one-shot watches.
//!
//! # Key Types
//!
//! - [`Store`] / [`Connector`] - Traits for the backing store
//! - [`SessionManager`] - Connects, retries and reconnects sessions
//! - [`WatchDispatcher`] - One-shot watch registrations for one session
//! - [`SequentialCoordinator`] - Ephemeral-sequential candidates and ranking
//! - [`LeaderElection`] - Smallest live candidate leads
//! - [`DistributedLock`] - Smallest live candidate holds the lock
//! - [`InMemoryStore`] - In-process store for tests and the `mem://` endpoint

pub mod config;
pub mod config_watch;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod health;
pub mod lock;
pub mod memory;
pub mod nodes;
pub mod session;
pub mod traits;
pub mod watch;

// Re-exports
pub use config::SessionConfig;
pub use config_watch::{ConfigValue, ConfigWatcher};
pub use coordinator::{CandidateHandle, PredecessorWatch, Rank, SequentialCoordinator};
pub use election::{ElectionResult, LeaderElection, LeaderInfo, LeadershipWait, LeadershipWatch};
pub use error::{
    ConnectionError, CoordinatorError, Error, LockError, NodeError, Result, StoreError,
};
pub use health::HealthRegistration;
pub use lock::{AcquireOptions, AcquireOutcome, DistributedLock, LockHandle};
pub use memory::InMemoryStore;
pub use nodes::NodeClient;
pub use session::{Session, SessionManager};
pub use traits::{
    Connector, CreateMode, EventKind, NodeMeta, SessionId, SessionState, Store, WatchedEvent,
};
pub use watch::{PendingWatch, WatchDispatcher, WatchKind, WatchRegistration};
