pub mod config;
pub mod crud;
pub mod elect;
pub mod health;
pub mod lock;
pub mod watch;

use std::sync::Arc;

use keel_coord::{InMemoryStore, SessionManager};

use crate::config::KeelConfig;

/// Shared state for the demo commands.
///
/// Every participant gets its own [`SessionManager`] over the same embedded
/// store, so contenders behave like separate processes.
pub struct Context {
    pub config: KeelConfig,
    store: InMemoryStore,
}

impl Context {
    pub fn new(config: KeelConfig) -> Self {
        Self {
            config,
            store: InMemoryStore::new(),
        }
    }

    /// A fresh session manager for one participant.
    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            self.config.session.clone(),
            Arc::new(self.store.clone()),
        ))
    }
}
