//! Session lifecycle against the store.
//!
//! The [`SessionManager`] owns at most one live [`Session`], reconnects with a
//! bounded number of attempts and publishes state transitions. Retry policy
//! lives here only; every other component propagates connection errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::ConnectionError;
use crate::traits::{Connector, SessionId, SessionState, Store};
use crate::watch::WatchDispatcher;

/// An established session. Cheap to clone; shared read-only by dependents.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    endpoint: String,
    timeout: Duration,
    established_at: DateTime<Utc>,
    store: Arc<dyn Store>,
    dispatcher: WatchDispatcher,
}

impl Session {
    fn new(endpoint: &str, timeout: Duration, store: Arc<dyn Store>) -> Self {
        let dispatcher = WatchDispatcher::new(Arc::clone(&store));
        Self {
            inner: Arc::new(SessionInner {
                id: store.session_id(),
                endpoint: endpoint.to_string(),
                timeout,
                established_at: Utc::now(),
                store,
                dispatcher,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Negotiated session timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    #[must_use]
    pub fn established_at(&self) -> DateTime<Utc> {
        self.inner.established_at
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Watch dispatcher bound to this session.
    #[must_use]
    pub fn dispatcher(&self) -> &WatchDispatcher {
        &self.inner.dispatcher
    }

    /// State as last reported by the store.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.store.state().borrow()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Wait until the store reports `Connected` or a state that can never
    /// recover. Returns the state reached.
    async fn settle(&self, timeout: Duration) -> Result<SessionState, ConnectionError> {
        let mut rx = self.inner.store.state();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == SessionState::Connected || !s.can_honor_watches())
                .await
                .map(|s| *s)
        })
        .await;

        match reached {
            Ok(Ok(state)) => Ok(state),
            // Store dropped its state channel: treat as gone
            Ok(Err(_)) => Ok(SessionState::Expired),
            Err(_) => Err(ConnectionError::Timeout {
                wanted: SessionState::Connected,
                timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

struct Active {
    session: Session,
    monitor: JoinHandle<()>,
}

/// Endpoint and per-attempt timeout of the latest `connect`.
#[derive(Clone)]
struct Target {
    endpoint: String,
    connect_timeout: Duration,
}

struct Slot {
    active: Option<Active>,
    target: Target,
}

/// Owns the connection lifecycle to the store.
pub struct SessionManager {
    /// Configuration for sessions.
    config: SessionConfig,

    /// Opens store sessions.
    connector: Arc<dyn Connector>,

    /// The live session, if any, and where to reconnect. Held across
    /// connects so they serialize.
    slot: Mutex<Slot>,

    /// Published state transitions.
    state: watch::Sender<SessionState>,

    /// Attempts made by the current or last connect.
    retry_count: AtomicU32,
}

impl SessionManager {
    /// Create a new session manager. No connection is made until
    /// [`connect`](Self::connect) or [`ensure_connected`](Self::ensure_connected).
    #[must_use]
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let target = Target {
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout,
        };
        Self {
            config,
            connector,
            slot: Mutex::new(Slot {
                active: None,
                target,
            }),
            state,
            retry_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current manager state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Attempts made by the current or last connect.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Wait until the manager reaches `target`.
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        timeout: Duration,
    ) -> Result<SessionState, ConnectionError> {
        let mut rx = self.subscribe();
        match tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == target).await.map(|s| *s)
        })
        .await
        {
            Ok(Ok(state)) => Ok(state),
            _ => Err(ConnectionError::Timeout {
                wanted: target,
                timeout,
            }),
        }
    }

    /// Establish a fresh session, replacing any existing one.
    ///
    /// Each attempt waits up to `timeout` for the store to report connected.
    /// After `max_connect_attempts` failures the manager is `Failed`. Later
    /// reconnects reuse `endpoint` and `timeout`.
    pub async fn connect(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Session, ConnectionError> {
        let mut slot = self.slot.lock().await;
        slot.target = Target {
            endpoint: endpoint.to_string(),
            connect_timeout: timeout,
        };
        self.connect_locked(&mut slot.active, endpoint, timeout).await
    }

    /// Return the live session, reconnecting if it expired or was closed.
    pub async fn ensure_connected(&self) -> Result<Session, ConnectionError> {
        let mut slot = self.slot.lock().await;
        let Target {
            endpoint,
            connect_timeout,
        } = slot.target.clone();

        if self.state() == SessionState::Failed {
            return Err(self.exhausted(&endpoint));
        }

        if let Some(current) = slot.active.as_ref() {
            let session = current.session.clone();
            if session.is_live() {
                return Ok(session);
            }

            // A partitioned session may still recover within the timeout
            if session.state().can_honor_watches() {
                debug!(session_id = session.id(), "Waiting for session to recover");
                if let Ok(SessionState::Connected) = session.settle(connect_timeout).await {
                    return Ok(session);
                }
            }

            warn!(
                session_id = session.id(),
                state = %session.state(),
                "Session lost, reconnecting"
            );
        }

        self.connect_locked(&mut slot.active, &endpoint, connect_timeout)
            .await
    }

    /// Close the current session. The store removes its ephemeral nodes.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.active.take() {
            current.monitor.abort();
            if let Err(e) = current.session.store().close().await {
                warn!(error = %e, session_id = current.session.id(), "Error closing session");
            }
            info!(session_id = current.session.id(), "Session closed");
        }
        self.state.send_replace(SessionState::Disconnected);
    }

    async fn connect_locked(
        &self,
        active: &mut Option<Active>,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Session, ConnectionError> {
        if let Some(previous) = active.take() {
            previous.monitor.abort();
            if let Err(e) = previous.session.store().close().await {
                warn!(
                    error = %e,
                    session_id = previous.session.id(),
                    "Error closing replaced session"
                );
            }
        }

        let max_attempts = self.config.max_connect_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.retry_count.store(attempt, Ordering::SeqCst);
            self.state.send_replace(SessionState::Connecting);
            info!(endpoint, attempt, max = max_attempts, "Connecting to store");

            match self.attempt(endpoint, timeout).await {
                Ok(store) => {
                    let session = Session::new(endpoint, self.config.session_timeout, store);
                    let monitor = self.spawn_monitor(&session);
                    *active = Some(Active {
                        session: session.clone(),
                        monitor,
                    });
                    self.state.send_replace(SessionState::Connected);
                    self.retry_count.store(0, Ordering::SeqCst);
                    info!(session_id = session.id(), endpoint, "Connected to store");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, max = max_attempts, error = %e, "Connection attempt failed");
                    self.state.send_replace(SessionState::Disconnected);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        error!(
            endpoint,
            attempts = max_attempts,
            "Max connection attempts reached, giving up"
        );
        self.state.send_replace(SessionState::Failed);
        Err(self.exhausted(endpoint))
    }

    /// One connection attempt: open, then wait for `Connected`.
    async fn attempt(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Store>, ConnectionError> {
        let store = self
            .connector
            .connect(endpoint, self.config.session_timeout)
            .await?;

        let mut rx = store.state();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == SessionState::Connected).await.is_ok()
        })
        .await;

        if matches!(reached, Ok(true)) {
            return Ok(store);
        }

        // Abandon the half-open session
        if let Err(e) = store.close().await {
            debug!(error = %e, "Error closing half-open session");
        }
        Err(ConnectionError::Timeout {
            wanted: SessionState::Connected,
            timeout,
        })
    }

    /// Mirror store-reported transitions into the manager state.
    fn spawn_monitor(&self, session: &Session) -> JoinHandle<()> {
        let mut rx = session.store().state();
        let state = self.state.clone();
        let session_id = session.id();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                match current {
                    SessionState::Expired => {
                        warn!(session_id, "Session expired");
                        state.send_replace(SessionState::Expired);
                        break;
                    }
                    SessionState::Disconnected => {
                        warn!(session_id, "Disconnected from store");
                        state.send_replace(SessionState::Disconnected);
                    }
                    SessionState::Connected => {
                        info!(session_id, "Reconnected to store");
                        state.send_replace(SessionState::Connected);
                    }
                    SessionState::Connecting | SessionState::Failed => {}
                }
            }
        })
    }

    fn exhausted(&self, endpoint: &str) -> ConnectionError {
        ConnectionError::ExhaustedRetries {
            endpoint: endpoint.to_string(),
            attempts: self.config.max_connect_attempts.max(1),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.slot.try_lock()
            && let Some(active) = guard.active.take()
        {
            active.monitor.abort();
        }
    }
}
