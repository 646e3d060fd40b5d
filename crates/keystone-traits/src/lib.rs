//! Core trait for talking to the coordination service.
//!
//! Everything keystone persists goes through [`CoordinationClient`]. The
//! service is assumed linearizable per node; no ordering is assumed across
//! nodes.

use async_trait::async_trait;
use keystone_kv_types::CoordinationClientError;
use keystone_kv_types::CreateMode;
use keystone_kv_types::NodeData;
use keystone_kv_types::NodeStat;
use keystone_kv_types::WatchEvent;
use keystone_kv_types::WatchEventKind;
use keystone_kv_types::parent_path;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Hierarchical, versioned, watchable node store.
///
/// Every method is a single round-trip. Conditional variants compare against
/// the node version and fail with `BadVersion` on mismatch.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node. Fails with `NodeExists` if present or `NoNode` if the parent is absent.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<NodeStat, CoordinationClientError>;

    /// Read a node's data and version.
    async fn read(&self, path: &str) -> Result<NodeData, CoordinationClientError>;

    /// Overwrite a node, optionally only if its version equals `expected_version`.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<NodeStat, CoordinationClientError>;

    /// Delete a node, optionally only if its version equals `expected_version`.
    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), CoordinationClientError>;

    /// Names (not paths) of a node's direct children.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationClientError>;

    /// Ensure the next read on this path observes every write committed before the call.
    async fn sync(&self, path: &str) -> Result<(), CoordinationClientError>;

    /// Register interest in changes to a single node.
    async fn watch(&self, path: &str) -> Result<NodeWatch, CoordinationClientError>;

    /// Create `path` and any missing ancestors. Existing nodes are left untouched.
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationClientError> {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if p == "/" {
                break;
            }
            match self.read(p).await {
                Ok(_) => break,
                Err(CoordinationClientError::NoNode { .. }) => {
                    missing.push(p.to_string());
                    current = parent_path(p);
                }
                Err(e) => return Err(e),
            }
        }
        for p in missing.into_iter().rev() {
            match self.create(&p, Vec::new(), CreateMode::Persistent).await {
                Ok(_) | Err(CoordinationClientError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationClient + ?Sized> CoordinationClient for std::sync::Arc<T> {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<NodeStat, CoordinationClientError> {
        (**self).create(path, data, mode).await
    }

    async fn read(&self, path: &str) -> Result<NodeData, CoordinationClientError> {
        (**self).read(path).await
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<NodeStat, CoordinationClientError> {
        (**self).set(path, data, expected_version).await
    }

    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), CoordinationClientError> {
        (**self).delete(path, expected_version).await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationClientError> {
        (**self).list_children(path).await
    }

    async fn sync(&self, path: &str) -> Result<(), CoordinationClientError> {
        (**self).sync(path).await
    }

    async fn watch(&self, path: &str) -> Result<NodeWatch, CoordinationClientError> {
        (**self).watch(path).await
    }

    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationClientError> {
        (**self).ensure_path(path).await
    }
}

/// Receiving half of a node watch.
///
/// Events for other paths sharing the underlying channel are filtered out.
pub struct NodeWatch {
    path: String,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl NodeWatch {
    /// Wrap a broadcast receiver, keeping only events for `path`.
    pub fn new(path: impl Into<String>, receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            path: path.into(),
            receiver,
        }
    }

    /// Path being watched.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change to the watched node.
    ///
    /// Returns `None` once the client has shut down. A lagging receiver
    /// reports a synthetic `DataChanged` so callers re-read instead of
    /// missing an update.
    pub async fn changed(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.path == self.path => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {
                    return Some(WatchEvent {
                        path: self.path.clone(),
                        kind: WatchEventKind::DataChanged,
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
