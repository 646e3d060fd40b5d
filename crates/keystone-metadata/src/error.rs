//! Tablet metadata errors.

use keystone_kv_types::CoordinationClientError;
use snafu::Snafu;

use crate::extent::KeyExtent;

/// Errors returned by the metadata store, mutator and tablet state store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetadataError {
    /// The coordination service could not be reached.
    #[snafu(display("metadata store unavailable during {operation}: {source}"))]
    StoreUnavailable {
        operation: &'static str,
        source: CoordinationClientError,
    },

    /// At least one mutation in a batch was not accepted.
    ///
    /// Accepted mutations in the same batch stay applied.
    #[snafu(display("{} of {} tablet mutations not accepted: {}", failed.len(), failed.len() + accepted, display_extents(failed)))]
    PartialApplyFailure { failed: Vec<KeyExtent>, accepted: usize },

    /// A stored record could not be decoded.
    #[snafu(display("malformed tablet metadata at '{path}': {source}"))]
    MalformedRecord { path: String, source: serde_json::Error },

    /// The same tablet was mutated twice in one batch.
    #[snafu(display("tablet {extent} mutated more than once in one batch"))]
    DuplicateMutation { extent: KeyExtent },

    /// A batch exceeded the per-batch limit.
    #[snafu(display("mutation batch of {size} tablets exceeds limit of {max}"))]
    BatchTooLarge { size: usize, max: usize },
}

fn display_extents(extents: &[KeyExtent]) -> String {
    extents.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}
