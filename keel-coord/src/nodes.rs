//! Plain node operations through the managed session.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{NodeError, StoreError};
use crate::session::SessionManager;
use crate::traits::{CreateMode, NodeMeta};

/// CRUD over the current session. Every call goes through
/// [`SessionManager::ensure_connected`].
#[derive(Clone)]
pub struct NodeClient {
    manager: Arc<SessionManager>,
}

impl NodeClient {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Create a node unless it already exists. Returns whether it was created.
    pub async fn create_if_absent(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<bool, NodeError> {
        let session = self.manager.ensure_connected().await?;
        match session.store().create(path, data, mode).await {
            Ok(created) => {
                info!(path = %created, ?mode, "Node created");
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(path, "Node already exists");
                Ok(false)
            }
            Err(e) => Err(NodeError::from_store(path, e)),
        }
    }

    /// Read a node's data and metadata.
    pub async fn read(&self, path: &str) -> Result<(Vec<u8>, NodeMeta), NodeError> {
        let session = self.manager.ensure_connected().await?;
        session
            .store()
            .get_data(path)
            .await
            .map_err(|e| NodeError::from_store(path, e))
    }

    /// Overwrite a node's data, optionally only at `version`.
    pub async fn update(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<NodeMeta, NodeError> {
        let session = self.manager.ensure_connected().await?;
        let meta = session
            .store()
            .set_data(path, data, version)
            .await
            .map_err(|e| NodeError::from_store(path, e))?;
        info!(path, version = meta.version, "Node updated");
        Ok(meta)
    }

    /// Delete a node, optionally only at `version`.
    pub async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), NodeError> {
        let session = self.manager.ensure_connected().await?;
        session
            .store()
            .delete(path, version)
            .await
            .map_err(|e| NodeError::from_store(path, e))?;
        info!(path, "Node deleted");
        Ok(())
    }

    /// Child names, sorted.
    pub async fn children(&self, path: &str) -> Result<Vec<String>, NodeError> {
        let session = self.manager.ensure_connected().await?;
        let mut children = session
            .store()
            .list_children(path, None)
            .await
            .map_err(|e| NodeError::from_store(path, e))?;
        children.sort();
        Ok(children)
    }

    pub async fn exists(&self, path: &str) -> Result<Option<NodeMeta>, NodeError> {
        let session = self.manager.ensure_connected().await?;
        session
            .store()
            .exists(path, None)
            .await
            .map_err(|e| NodeError::from_store(path, e))
    }
}
