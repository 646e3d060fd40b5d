//! Error types for the conditional-write engine.

use keystone_kv_types::CoordinationClientError;
use snafu::Snafu;

/// Errors that prevent a conditional write from reaching any outcome.
///
/// An ambiguous write is not an error; it is reported as
/// [`MutationOutcome::Unknown`](crate::MutationOutcome::Unknown).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConditionalWriteError {
    /// The node could not be read, so nothing was written.
    #[snafu(display("coordination service unavailable while reading '{path}': {source}"))]
    Unavailable {
        /// Path being mutated.
        path: String,
        /// The underlying client error.
        source: CoordinationClientError,
    },

    /// Every attempt lost a version race.
    #[snafu(display("conditional write on '{path}' exceeded {attempts} attempts"))]
    RetriesExhausted {
        /// Path being mutated.
        path: String,
        /// Number of attempts made.
        attempts: u32,
    },
}
