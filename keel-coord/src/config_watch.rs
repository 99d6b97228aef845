//! Follow a configuration node through one-shot watches.
//!
//! Each round arms an existence watch, reads the node, publishes the value and
//! waits for the watch to fire. The watch is always armed before the read so
//! no change between rounds goes unseen.

use std::borrow::Cow;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, StoreError};
use crate::session::SessionManager;
use crate::traits::{EventKind, validate_path};

/// A configuration value as last read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub data: Vec<u8>,
    pub version: i32,
}

impl ConfigValue {
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Watches a single node and publishes every value it takes.
pub struct ConfigWatcher {
    manager: Arc<SessionManager>,
    path: String,
}

impl ConfigWatcher {
    pub fn new(manager: Arc<SessionManager>, path: impl Into<String>) -> Self {
        Self {
            manager,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run in the background. The receiver holds `None` while the node is
    /// absent.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (
        watch::Receiver<Option<ConfigValue>>,
        JoinHandle<Result<(), CoordinatorError>>,
    ) {
        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(async move { self.run(&tx, &cancel).await });
        (rx, handle)
    }

    /// Publish values on `tx` until cancelled.
    ///
    /// Fails with `SessionLost` when the session ends; callers restart the
    /// watcher after reconnecting.
    pub async fn run(
        &self,
        tx: &watch::Sender<Option<ConfigValue>>,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        validate_path(&self.path).map_err(|e| CoordinatorError::from_store(&self.path, e))?;
        let session = self.manager.ensure_connected().await?;
        info!(path = %self.path, "Watching configuration");

        loop {
            let (meta, mut pending) = session.dispatcher().register_existence(&self.path).await?;

            let value = match meta {
                None => None,
                Some(_) => match session.store().get_data(&self.path).await {
                    Ok((data, meta)) => Some(ConfigValue {
                        data,
                        version: meta.version,
                    }),
                    // Deleted since the stat; the armed watch has fired
                    Err(StoreError::NotFound(_)) => None,
                    Err(e) => return Err(CoordinatorError::from_store(&self.path, e)),
                },
            };

            let changed = tx.send_if_modified(|current| {
                if *current == value {
                    return false;
                }
                *current = value.clone();
                true
            });
            if changed {
                match &value {
                    Some(v) => info!(path = %self.path, version = v.version, "Configuration changed"),
                    None => info!(path = %self.path, "Configuration absent"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(path = %self.path, "Configuration watch stopped");
                    return Ok(());
                }
                event = pending.fired() => {
                    if event.kind == EventKind::SessionChanged {
                        warn!(path = %self.path, state = ?event.session_state, "Session lost while watching configuration");
                        return Err(CoordinatorError::SessionLost);
                    }
                    debug!(path = %self.path, kind = ?event.kind, "Configuration watch fired");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::InMemoryStore;
    use crate::nodes::NodeClient;
    use crate::traits::CreateMode;

    fn manager(store: &InMemoryStore) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(100)),
            Arc::new(store.clone()),
        ))
    }

    async fn next_value(rx: &mut watch::Receiver<Option<ConfigValue>>) -> Option<ConfigValue> {
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn publishes_each_change() {
        let store = InMemoryStore::new();
        let writer = NodeClient::new(manager(&store));
        writer
            .create_if_absent("/cfg", b"v1", CreateMode::Persistent)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (mut rx, handle) = ConfigWatcher::new(manager(&store), "/cfg").spawn(cancel.clone());

        let first = next_value(&mut rx).await.unwrap();
        assert_eq!(first.text(), "v1");

        writer.update("/cfg", b"v2", None).await.unwrap();
        let second = next_value(&mut rx).await.unwrap();
        assert_eq!(second.text(), "v2");
        assert_eq!(second.version, 1);

        writer.update("/cfg", b"v3", None).await.unwrap();
        assert_eq!(next_value(&mut rx).await.unwrap().text(), "v3");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follows_node_creation_and_deletion() {
        let store = InMemoryStore::new();
        let writer = NodeClient::new(manager(&store));

        let cancel = CancellationToken::new();
        let (mut rx, handle) = ConfigWatcher::new(manager(&store), "/late").spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*rx.borrow(), None);

        writer
            .create_if_absent("/late", b"on", CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(next_value(&mut rx).await.unwrap().text(), "on");

        writer.delete("/late", None).await.unwrap();
        assert_eq!(next_value(&mut rx).await, None);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stops_with_session_lost_on_expiry() {
        let store = InMemoryStore::new();
        let watcher_manager = manager(&store);
        let session = watcher_manager.ensure_connected().await.unwrap();

        let (tx, _rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let watcher = ConfigWatcher::new(Arc::clone(&watcher_manager), "/cfg");

        let expire = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.expire_session(session.id()).await;
            })
        };

        let err = watcher.run(&tx, &cancel).await.unwrap_err();
        expire.await.unwrap();
        assert_eq!(err, CoordinatorError::SessionLost);
    }
}
