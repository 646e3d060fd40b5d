//! Node, version and watch types.

use serde::Deserialize;
use serde::Serialize;

/// Version metadata attached to every node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, 0 at creation and incremented on every `set`.
    ///
    /// Conditional writes compare against this value.
    pub version: u64,
    /// Creation time (Unix milliseconds).
    pub ctime_ms: u64,
    /// Last modification time (Unix milliseconds).
    pub mtime_ms: u64,
}

/// A node's payload together with its version metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub stat: NodeStat,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    #[default]
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    DataChanged,
    Deleted,
    ChildrenChanged,
}

/// Notification delivered to a watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Join a parent path and a child name with exactly one separator.
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{parent}/{child}")
}

/// Parent of a path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}
