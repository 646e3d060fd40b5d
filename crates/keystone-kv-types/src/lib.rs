//! Types exchanged with the coordination service.
//!
//! The coordination service is a hierarchical, linearizable, watchable store
//! (a ZooKeeper-style ensemble). These types describe nodes, their version
//! metadata, watch notifications and the errors the client can report. They
//! carry no behaviour of their own so that both production clients and the
//! deterministic test client can share them.

mod error;
mod node;

pub use error::CoordinationClientError;
pub use node::CreateMode;
pub use node::NodeData;
pub use node::NodeStat;
pub use node::WatchEvent;
pub use node::WatchEventKind;
pub use node::join_path;
pub use node::parent_path;
