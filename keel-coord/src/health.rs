//! Server liveness through an ephemeral node and periodic heartbeats.
//!
//! The node lives exactly as long as the session, so other participants can
//! list `<health_path>` to see which servers are up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::ensure_path;
use crate::error::{CoordinatorError, StoreError};
use crate::session::SessionManager;
use crate::traits::{CreateMode, join_path};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Registers one server under a health path and keeps it fresh.
pub struct HealthRegistration {
    manager: Arc<SessionManager>,
    health_path: String,
    server_id: String,
    interval: Duration,
    max_beats: Option<u64>,
}

impl HealthRegistration {
    pub fn new(
        manager: Arc<SessionManager>,
        health_path: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            health_path: health_path.into(),
            server_id: server_id.into(),
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_beats: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop by itself after `beats` heartbeats.
    #[must_use]
    pub fn with_max_beats(mut self, beats: u64) -> Self {
        self.max_beats = Some(beats);
        self
    }

    /// Path of this server's health node.
    #[must_use]
    pub fn node_path(&self) -> String {
        join_path(&self.health_path, &self.server_id)
    }

    /// Register, heartbeat until cancelled or `max_beats` is reached, then
    /// deregister. Returns the number of heartbeats written.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<u64, CoordinatorError> {
        let session = self.manager.ensure_connected().await?;
        let store = session.store();
        let path = self.node_path();

        ensure_path(store.as_ref(), &self.health_path).await?;
        store
            .create(&path, heartbeat().as_bytes(), CreateMode::Ephemeral)
            .await
            .map_err(|e| CoordinatorError::from_store(&path, e))?;
        info!(path = %path, session_id = session.id(), "Registered server health");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut beats = 0u64;
        while self.max_beats.is_none_or(|max| beats < max) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match store.set_data(&path, heartbeat().as_bytes(), None).await {
                Ok(meta) => {
                    beats += 1;
                    debug!(path = %path, beats, version = meta.version, "Heartbeat");
                }
                Err(StoreError::ConnectionLoss) => {
                    warn!(path = %path, "Heartbeat skipped, store unreachable");
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(path = %path, "Health node vanished");
                    return Err(CoordinatorError::SessionLost);
                }
                Err(e) => return Err(CoordinatorError::from_store(&path, e)),
            }
        }

        match store.delete(&path, None).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                info!(path = %path, beats, "Deregistered server health");
                Ok(beats)
            }
            Err(e) => Err(CoordinatorError::from_store(&path, e)),
        }
    }
}

fn heartbeat() -> String {
    Utc::now().to_rfc3339()
}
