//! Transaction identity, status and reservation types.

use std::fmt;
use std::str::FromStr;

use keystone_constants::fate::MAX_OWNER_ID_LEN;
use keystone_constants::fate::TX_NODE_PREFIX;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use uuid::Uuid;

/// Which store instance a transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FateInstanceType {
    /// Transactions that operate on system metadata.
    Meta,
    /// Transactions that operate on user tables.
    User,
}

impl FateInstanceType {
    /// Upper-case tag used in the canonical id form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FateInstanceType::Meta => "META",
            FateInstanceType::User => "USER",
        }
    }
}

impl fmt::Display for FateInstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`FateId`] from its canonical string form.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(display("invalid transaction id '{input}': {reason}"))]
pub struct ParseFateIdError {
    pub input: String,
    pub reason: String,
}

/// Globally unique transaction identifier.
///
/// Canonical form is `FATE:<TYPE>:<uuid>`; the coordination node is named
/// `tx_<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FateId {
    pub instance_type: FateInstanceType,
    pub tx_uuid: Uuid,
}

impl FateId {
    pub fn new(instance_type: FateInstanceType, tx_uuid: Uuid) -> Self {
        Self { instance_type, tx_uuid }
    }

    /// Name of the node holding this transaction's record.
    pub fn node_name(&self) -> String {
        format!("{TX_NODE_PREFIX}{}", self.tx_uuid)
    }

    /// Recover an id from a child node name, ignoring unrelated children.
    pub fn from_node_name(instance_type: FateInstanceType, name: &str) -> Option<Self> {
        let uuid = name.strip_prefix(TX_NODE_PREFIX)?;
        Uuid::parse_str(uuid).ok().map(|tx_uuid| Self::new(instance_type, tx_uuid))
    }
}

impl fmt::Display for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATE:{}:{}", self.instance_type, self.tx_uuid)
    }
}

impl FromStr for FateId {
    type Err = ParseFateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| ParseFateIdError {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.splitn(3, ':');
        if parts.next() != Some("FATE") {
            return Err(fail("missing FATE prefix"));
        }
        let instance_type = match parts.next() {
            Some("META") => FateInstanceType::Meta,
            Some("USER") => FateInstanceType::User,
            _ => return Err(fail("unknown instance type")),
        };
        let uuid = parts.next().ok_or_else(|| fail("missing uuid"))?;
        let tx_uuid = Uuid::parse_str(uuid).map_err(|e| fail(&e.to_string()))?;
        Ok(Self::new(instance_type, tx_uuid))
    }
}

/// Source of fresh transaction ids.
pub trait FateIdGenerator: Send + Sync {
    fn new_fate_id(&self, instance_type: FateInstanceType) -> FateId;
}

/// Random v4 UUID generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomFateIdGenerator;

impl FateIdGenerator for RandomFateIdGenerator {
    fn new_fate_id(&self, instance_type: FateInstanceType) -> FateId {
        FateId::new(instance_type, Uuid::new_v4())
    }
}

/// Transaction status.
///
/// Progress is monotonic; see [`TStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TStatus {
    New,
    Submitted,
    InProgress,
    FailedInProgress,
    Failed,
    Successful,
    /// Record absent. Observed, never stored.
    Unknown,
}

impl TStatus {
    pub const ALL: [TStatus; 7] = [
        TStatus::New,
        TStatus::Submitted,
        TStatus::InProgress,
        TStatus::FailedInProgress,
        TStatus::Failed,
        TStatus::Successful,
        TStatus::Unknown,
    ];

    /// Stable tag written into transaction records.
    pub fn as_str(&self) -> &'static str {
        match self {
            TStatus::New => "NEW",
            TStatus::Submitted => "SUBMITTED",
            TStatus::InProgress => "IN_PROGRESS",
            TStatus::FailedInProgress => "FAILED_IN_PROGRESS",
            TStatus::Failed => "FAILED",
            TStatus::Successful => "SUCCESSFUL",
            TStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == tag)
    }

    /// Whether the transaction has finished and its record may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TStatus::Successful | TStatus::Failed)
    }

    /// Whether a stored record may move from `self` to `next`.
    ///
    /// Rewriting the current status is always allowed. `Unknown` is never a
    /// valid target.
    pub fn can_transition_to(&self, next: TStatus) -> bool {
        use TStatus::*;
        if next == Unknown {
            return false;
        }
        if *self == next {
            return true;
        }
        match self {
            New => matches!(next, Submitted | InProgress | FailedInProgress | Failed),
            Submitted => matches!(next, InProgress | FailedInProgress | Failed),
            InProgress => matches!(next, Successful | Failed | FailedInProgress),
            FailedInProgress => matches!(next, Failed),
            Failed | Successful | Unknown => false,
        }
    }
}

impl fmt::Display for TStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a worker that can hold reservations.
///
/// Non-empty and at most [`MAX_OWNER_ID_LEN`] bytes, so it always fits the
/// record's length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

/// Rejected owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum InvalidOwnerIdError {
    #[snafu(display("owner id must not be empty"))]
    Empty,

    #[snafu(display("owner id is {len} bytes, limit is {max}"))]
    TooLong { len: usize, max: usize },
}

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidOwnerIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidOwnerIdError::Empty);
        }
        if id.len() > MAX_OWNER_ID_LEN {
            return Err(InvalidOwnerIdError::TooLong {
                len: id.len(),
                max: MAX_OWNER_ID_LEN,
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = InvalidOwnerIdError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<OwnerId> for String {
    fn from(owner: OwnerId) -> Self {
        owner.0
    }
}

impl FromStr for OwnerId {
    type Err = InvalidOwnerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive execution claim attached to a transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FateReservation {
    pub owner: OwnerId,
    /// When the claim was made (Unix milliseconds, owner's clock).
    pub created_ms: u64,
}

impl FateReservation {
    pub fn new(owner: OwnerId, created_ms: u64) -> Self {
        Self { owner, created_ms }
    }

    /// Age relative to `now_ms`, zero if the stamp is in the future.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_ms)
    }
}

impl fmt::Display for FateReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.created_ms)
    }
}

/// One entry of a transaction listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FateIdStatus {
    pub fate_id: FateId,
    pub status: TStatus,
    pub reservation: Option<FateReservation>,
}
