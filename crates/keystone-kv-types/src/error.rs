//! Errors reported by a coordination client.

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Errors from a single coordination service round-trip.
///
/// These never cross a store boundary; the transaction and metadata stores
/// wrap them into their own taxonomies.
#[derive(Debug, Clone, Snafu, Serialize, Deserialize, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum CoordinationClientError {
    /// The node does not exist.
    #[snafu(display("node '{path}' does not exist"))]
    NoNode {
        /// Path of the missing node.
        path: String,
    },

    /// The node already exists.
    #[snafu(display("node '{path}' already exists"))]
    NodeExists {
        /// Path of the existing node.
        path: String,
    },

    /// A versioned write found a different version than expected.
    #[snafu(display("version mismatch on '{path}': expected {expected}, found {actual}"))]
    BadVersion {
        /// Path of the node.
        path: String,
        /// Version the caller expected.
        expected: u64,
        /// Version present at write time.
        actual: u64,
    },

    /// The node still has children and cannot be deleted.
    #[snafu(display("node '{path}' has children"))]
    NotEmpty {
        /// Path of the node.
        path: String,
    },

    /// The connection dropped; the outcome of an in-flight write is unknown.
    #[snafu(display("connection lost: {reason}"))]
    ConnectionLoss {
        /// Description of the failure.
        reason: String,
    },

    /// The client session expired.
    #[snafu(display("session expired"))]
    SessionExpired,

    /// The round-trip did not complete in time.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Bound that was exceeded.
        duration_ms: u64,
    },
}

impl CoordinationClientError {
    /// True when the service could not be reached or did not answer.
    ///
    /// For writes, these errors leave the outcome undetermined.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CoordinationClientError::ConnectionLoss { .. }
                | CoordinationClientError::SessionExpired
                | CoordinationClientError::Timeout { .. }
        )
    }

    /// True when a conditional write lost a race and may be re-evaluated.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordinationClientError::BadVersion { .. }
                | CoordinationClientError::NodeExists { .. }
                | CoordinationClientError::NoNode { .. }
        )
    }
}
