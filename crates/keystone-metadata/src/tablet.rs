//! Tablet metadata records.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::extent::KeyExtent;

/// Tier of the metadata hierarchy a tablet's record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLevel {
    /// The single root tablet.
    Root,
    /// Tablets of the metadata table.
    Metadata,
    /// Tablets of user tables.
    User,
}

impl DataLevel {
    pub const ALL: [DataLevel; 3] = [DataLevel::Root, DataLevel::Metadata, DataLevel::User];

    /// Path segment of this level's records.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataLevel::Root => "root",
            DataLevel::Metadata => "metadata",
            DataLevel::User => "user",
        }
    }
}

impl fmt::Display for DataLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tablet server process: its address plus the session distinguishing restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerInstance {
    pub host_port: String,
    pub session: String,
}

impl ServerInstance {
    pub fn new(host_port: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            session: session.into(),
        }
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.host_port, self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// The server is hosting the tablet.
    Current,
    /// The tablet has been assigned to the server but not yet loaded.
    Future,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub server: ServerInstance,
    pub kind: LocationType,
}

impl Location {
    pub fn current(server: ServerInstance) -> Self {
        Self {
            server,
            kind: LocationType::Current,
        }
    }

    pub fn future(server: ServerInstance) -> Self {
        Self {
            server,
            kind: LocationType::Future,
        }
    }
}

/// Marks a tablet whose last host is presumed gone; placement is deferred
/// in the hope the host returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuspensionMark {
    pub server: ServerInstance,
    pub timestamp_ms: u64,
}

impl SuspensionMark {
    pub fn new(server: ServerInstance, timestamp_ms: u64) -> Self {
        Self { server, timestamp_ms }
    }
}

/// Persisted state of one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub extent: KeyExtent,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub suspend: Option<SuspensionMark>,
    /// Id of an in-flight operation (split, merge, delete) that owns the tablet.
    #[serde(default)]
    pub operation_id: Option<String>,
}

impl TabletMetadata {
    pub fn new(extent: KeyExtent) -> Self {
        Self {
            extent,
            location: None,
            suspend: None,
            operation_id: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_suspend(mut self, suspend: SuspensionMark) -> Self {
        self.suspend = Some(suspend);
        self
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// Server currently hosting the tablet, if any.
    pub fn current_server(&self) -> Option<&ServerInstance> {
        self.location.as_ref().filter(|l| l.kind == LocationType::Current).map(|l| &l.server)
    }

    pub fn has_current(&self) -> bool {
        self.current_server().is_some()
    }

    /// What the management scan would flag on this tablet.
    pub fn management_actions(&self) -> BTreeSet<ManagementAction> {
        let mut actions = BTreeSet::new();
        if self.suspend.is_some() {
            actions.insert(ManagementAction::Suspended);
        } else if !self.has_current() {
            actions.insert(ManagementAction::NeedsLocation);
        }
        if self.operation_id.is_some() {
            actions.insert(ManagementAction::OperationPending);
        }
        actions
    }
}

/// Why a tablet was surfaced by the management scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ManagementAction {
    /// Not hosted and not suspended.
    NeedsLocation,
    /// Carries a suspension mark.
    Suspended,
    /// An operation holds the tablet.
    OperationPending,
    /// Pushed by a producer; state may need re-evaluation.
    StateChange,
}

/// A tablet together with the reasons it needs attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletManagement {
    pub tablet: TabletMetadata,
    pub actions: BTreeSet<ManagementAction>,
}

impl TabletManagement {
    /// Notification that `tablet`'s state changed.
    pub fn state_change(tablet: TabletMetadata) -> Self {
        Self {
            tablet,
            actions: BTreeSet::from([ManagementAction::StateChange]),
        }
    }

    /// Result of evaluating a scanned tablet, or `None` if nothing needs doing.
    pub fn from_scan(tablet: TabletMetadata) -> Option<Self> {
        let actions = tablet.management_actions();
        if actions.is_empty() {
            return None;
        }
        Some(Self { tablet, actions })
    }
}
