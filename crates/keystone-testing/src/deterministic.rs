//! In-memory deterministic implementation of [`CoordinationClient`] for testing.
//!
//! Mirrors the behaviour of a ZooKeeper-style ensemble without network or
//! disk I/O: hierarchical nodes whose parents must exist, per-node versions
//! that start at 0 and advance on every `set`, version-checked writes and
//! deletes, and watch notifications.
//!
//! # Failure injection
//!
//! - [`set_available`](DeterministicCoordinationClient::set_available): every
//!   call fails with `ConnectionLoss` while unavailable, without side effects.
//! - [`fail_writes_after_apply`](DeterministicCoordinationClient::fail_writes_after_apply):
//!   the next N writes are applied but report `ConnectionLoss`, reproducing
//!   the ambiguous outcome of a connection dropped mid-write.
//! - [`set_latency`](DeterministicCoordinationClient::set_latency): every call
//!   sleeps first, for exercising caller timeouts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use keystone_kv_types::CoordinationClientError;
use keystone_kv_types::CreateMode;
use keystone_kv_types::NodeData;
use keystone_kv_types::NodeStat;
use keystone_kv_types::WatchEvent;
use keystone_kv_types::WatchEventKind;
use keystone_kv_types::parent_path;
use keystone_traits::CoordinationClient;
use keystone_traits::NodeWatch;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the shared watch channel.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: NodeStat,
}

/// In-memory deterministic coordination client.
///
/// Cloning shares the same underlying tree, so several "workers" can hold
/// handles to one simulated ensemble.
#[derive(Clone)]
pub struct DeterministicCoordinationClient {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    watchers: broadcast::Sender<WatchEvent>,
    available: Arc<AtomicBool>,
    ambiguous_writes: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl Default for DeterministicCoordinationClient {
    fn default() -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            nodes: Arc::new(Mutex::new(BTreeMap::new())),
            watchers,
            available: Arc::new(AtomicBool::new(true)),
            ambiguous_writes: Arc::new(AtomicU32::new(0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            reads: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl DeterministicCoordinationClient {
    /// Create an empty in-memory ensemble wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Toggle reachability. While unavailable every call fails with `ConnectionLoss`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Apply the next `count` writes but report `ConnectionLoss` for each.
    pub fn fail_writes_after_apply(&self, count: u32) {
        self.ambiguous_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of reads (`read`, `list_children`) served since the last reset.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of write attempts (`create`, `set`, `delete`) since the last reset.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Zero the read and write counters.
    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    /// Number of nodes currently stored.
    pub async fn node_count(&self) -> usize {
        self.nodes.lock().await.len()
    }

    async fn enter(&self) -> Result<(), CoordinationClientError> {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoordinationClientError::ConnectionLoss {
                reason: "coordination service unreachable".to_string(),
            });
        }
        Ok(())
    }

    /// Report `ConnectionLoss` after an applied write if injection is armed.
    fn finish_write<T>(&self, result: T) -> Result<T, CoordinationClientError> {
        let armed = self
            .ambiguous_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(CoordinationClientError::ConnectionLoss {
                reason: "connection dropped after write".to_string(),
            });
        }
        Ok(result)
    }

    fn notify(&self, path: &str, kind: WatchEventKind) {
        // No receivers is not an error.
        let _ = self.watchers.send(WatchEvent {
            path: path.to_string(),
            kind,
        });
    }

    fn parent_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        match parent_path(path) {
            None | Some("/") => true,
            Some(parent) => nodes.contains_key(parent),
        }
    }

    fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        nodes.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix))
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[async_trait]
impl CoordinationClient for DeterministicCoordinationClient {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<NodeStat, CoordinationClientError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(path) {
            return Err(CoordinationClientError::NodeExists { path: path.to_string() });
        }
        if !Self::parent_exists(&nodes, path) {
            return Err(CoordinationClientError::NoNode {
                path: parent_path(path).unwrap_or("/").to_string(),
            });
        }
        let now = now_ms();
        let stat = NodeStat {
            version: 0,
            ctime_ms: now,
            mtime_ms: now,
        };
        nodes.insert(path.to_string(), Node { data, stat });
        drop(nodes);

        trace!(path, ?mode, "created node");
        self.notify(path, WatchEventKind::Created);
        if let Some(parent) = parent_path(path) {
            self.notify(parent, WatchEventKind::ChildrenChanged);
        }
        self.finish_write(stat)
    }

    async fn read(&self, path: &str) -> Result<NodeData, CoordinationClientError> {
        self.enter().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let nodes = self.nodes.lock().await;
        match nodes.get(path) {
            Some(node) => Ok(NodeData {
                data: node.data.clone(),
                stat: node.stat,
            }),
            None => Err(CoordinationClientError::NoNode { path: path.to_string() }),
        }
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<NodeStat, CoordinationClientError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationClientError::NoNode { path: path.to_string() })?;
        if let Some(expected) = expected_version
            && expected != node.stat.version
        {
            return Err(CoordinationClientError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.stat.version,
            });
        }
        node.data = data;
        node.stat.version += 1;
        node.stat.mtime_ms = now_ms();
        let stat = node.stat;
        drop(nodes);

        trace!(path, version = stat.version, "set node");
        self.notify(path, WatchEventKind::DataChanged);
        self.finish_write(stat)
    }

    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), CoordinationClientError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().await;
        let version = nodes
            .get(path)
            .map(|node| node.stat.version)
            .ok_or_else(|| CoordinationClientError::NoNode { path: path.to_string() })?;
        if let Some(expected) = expected_version
            && expected != version
        {
            return Err(CoordinationClientError::BadVersion {
                path: path.to_string(),
                expected,
                actual: version,
            });
        }
        if Self::has_children(&nodes, path) {
            return Err(CoordinationClientError::NotEmpty { path: path.to_string() });
        }
        nodes.remove(path);
        drop(nodes);

        trace!(path, "deleted node");
        self.notify(path, WatchEventKind::Deleted);
        if let Some(parent) = parent_path(path) {
            self.notify(parent, WatchEventKind::ChildrenChanged);
        }
        self.finish_write(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationClientError> {
        self.enter().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let nodes = self.nodes.lock().await;
        let is_root = path.trim_end_matches('/').is_empty();
        if !is_root && !nodes.contains_key(path) {
            return Err(CoordinationClientError::NoNode { path: path.to_string() });
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn sync(&self, _path: &str) -> Result<(), CoordinationClientError> {
        // Single in-memory replica: every read is already current.
        self.enter().await
    }

    async fn watch(&self, path: &str) -> Result<NodeWatch, CoordinationClientError> {
        self.enter().await?;
        Ok(NodeWatch::new(path, self.watchers.subscribe()))
    }
}
