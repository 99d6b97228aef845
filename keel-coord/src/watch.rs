//! One-shot watch registrations.
//!
//! A [`WatchDispatcher`] is bound to a single session and keeps a registry of
//! pending registrations keyed by `(path, kind)`. Each registration delivers
//! at most one event: the store's notification, or a synthetic
//! `SessionChanged` event once the session can no longer honor the watch.
//! Nothing is re-armed automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CoordinatorError;
use crate::traits::{NodeMeta, SessionState, Store, WatchedEvent};

/// What a registration observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, deletion or data change of the node itself.
    Existence,
    /// Changes to the node's child list.
    Children,
}

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub path: String,
    pub kind: WatchKind,
}

impl WatchKey {
    pub fn existence(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: WatchKind::Existence,
        }
    }

    pub fn children(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: WatchKind::Children,
        }
    }
}

type Registry = HashMap<WatchKey, HashMap<u64, CancellationToken>>;

/// Dispatches one-shot watch notifications for one session.
#[derive(Clone)]
pub struct WatchDispatcher {
    store: Arc<dyn Store>,
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl WatchDispatcher {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arm an existence watch and stat the node in the same round trip.
    pub async fn register_existence(
        &self,
        path: &str,
    ) -> Result<(Option<NodeMeta>, PendingWatch), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        let meta = self
            .store
            .exists(path, Some(tx))
            .await
            .map_err(|e| CoordinatorError::from_store(path, e))?;
        Ok((meta, self.deliver(WatchKey::existence(path), rx)))
    }

    /// Arm a child watch and list the children in the same round trip.
    pub async fn register_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, PendingWatch), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        let children = self
            .store
            .list_children(path, Some(tx))
            .await
            .map_err(|e| CoordinatorError::from_store(path, e))?;
        Ok((children, self.deliver(WatchKey::children(path), rx)))
    }

    /// Call `on_event` exactly once when the node at `path` is created,
    /// deleted or modified, or when the session can no longer honor the
    /// watch. Re-registration is up to the caller.
    pub async fn watch_existence<F>(
        &self,
        path: &str,
        on_event: F,
    ) -> Result<WatchRegistration, CoordinatorError>
    where
        F: FnOnce(WatchedEvent) + Send + 'static,
    {
        let (_, pending) = self.register_existence(path).await?;
        let registration = WatchRegistration {
            key: pending.key.clone(),
            cancel: pending.cancel.clone(),
        };

        tokio::spawn(async move {
            let mut pending = pending;
            let Some(rx) = pending.rx.take() else {
                return;
            };
            match rx.await {
                Ok(event) => on_event(event),
                Err(_) => trace!(path = %pending.key.path, "Watch deregistered before firing"),
            }
        });

        Ok(registration)
    }

    /// Number of registrations still waiting to fire.
    #[must_use]
    pub fn pending(&self, path: &str, kind: WatchKind) -> usize {
        let key = WatchKey {
            path: path.to_string(),
            kind,
        };
        self.lock_registry().get(&key).map_or(0, HashMap::len)
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, key: WatchKey, from_store: oneshot::Receiver<WatchedEvent>) -> PendingWatch {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.lock_registry()
            .entry(key.clone())
            .or_default()
            .insert(id, cancel.clone());

        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let mut state = self.store.state();
        let last_state = self.store.state();
        let task_key = key.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let event = tokio::select! {
                _ = token.cancelled() => None,
                fired = from_store => Some(fired.unwrap_or_else(|_| {
                    // Store dropped the registration with the session
                    WatchedEvent::session_changed(&task_key.path, *last_state.borrow())
                })),
                changed = state.wait_for(|s| !s.can_honor_watches()) => {
                    let current = changed.map(|s| *s).unwrap_or(SessionState::Expired);
                    Some(WatchedEvent::session_changed(&task_key.path, current))
                }
            };

            {
                let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(ids) = registry.get_mut(&task_key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        registry.remove(&task_key);
                    }
                }
            }

            match event {
                Some(event) => {
                    debug!(path = %task_key.path, kind = ?event.kind, "Watch fired");
                    let _ = tx.send(event);
                }
                None => trace!(path = %task_key.path, "Watch cancelled"),
            }
        });

        PendingWatch {
            key,
            rx: Some(rx),
            cancel,
        }
    }
}

/// Handle for a callback registration made with
/// [`WatchDispatcher::watch_existence`].
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    key: WatchKey,
    cancel: CancellationToken,
}

impl WatchRegistration {
    #[must_use]
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Deregister; the callback will not run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// A registration awaited as a future. Dropping it deregisters.
#[derive(Debug)]
pub struct PendingWatch {
    key: WatchKey,
    /// `None` once the event has been delivered.
    rx: Option<oneshot::Receiver<WatchedEvent>>,
    cancel: CancellationToken,
}

impl PendingWatch {
    /// A watch that has already fired with `event`.
    pub(crate) fn ready(key: WatchKey, event: WatchedEvent) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(event);
        Self {
            key,
            rx: Some(rx),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Wait for the watch to fire. The event is a hint to re-read state.
    ///
    /// A watch delivers once. Awaiting it again after delivery never
    /// resolves; register a new watch instead.
    pub async fn fired(&mut self) -> WatchedEvent {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        let event = match rx.await {
            Ok(event) => event,
            Err(_) => WatchedEvent::session_changed(&self.key.path, SessionState::Disconnected),
        };
        self.rx = None;
        event
    }

    /// Whether the event has already been delivered.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.rx.is_none()
    }

    /// Deregister without waiting.
    pub fn cancel(self) {
        self.cancel.cancel();
    }
}

impl Drop for PendingWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
