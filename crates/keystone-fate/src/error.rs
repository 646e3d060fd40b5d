//! Transaction store errors.
//!
//! Client errors are wrapped here and never returned directly.

use keystone_core::ConditionalWriteError;
use keystone_kv_types::CoordinationClientError;
use snafu::Snafu;

use crate::codec::CodecError;
use crate::types::FateId;
use crate::types::FateReservation;
use crate::types::OwnerId;
use crate::types::TStatus;

/// Errors returned by [`MetaFateStore`](crate::MetaFateStore).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FateError {
    /// The coordination service could not be reached or did not confirm a write.
    ///
    /// Callers retry with backoff and assume no side effect completed.
    #[snafu(display("transaction store unavailable during {operation}: {source}"))]
    StoreUnavailable {
        operation: &'static str,
        source: CoordinationClientError,
    },

    /// A write assuming ownership found the reservation changed underneath it.
    #[snafu(display("reservation on {fate_id} lost by {owner} (now held by {current:?})"))]
    ReservationLost {
        fate_id: FateId,
        owner: OwnerId,
        current: Option<FateReservation>,
    },

    /// The node exists but its contents could not be decoded.
    #[snafu(display("malformed record for {fate_id}: {source}"))]
    MalformedRecord { fate_id: FateId, source: CodecError },

    /// The requested status would move the transaction backwards.
    #[snafu(display("{fate_id} cannot move from {from} to {to}"))]
    InvalidStatusTransition { fate_id: FateId, from: TStatus, to: TStatus },

    /// Only finished transactions may be deleted.
    #[snafu(display("{fate_id} is {status}, not terminal"))]
    NotTerminal { fate_id: FateId, status: TStatus },

    /// Forced takeover was not permitted.
    #[snafu(display("takeover of {fate_id} refused: {reason}"))]
    TakeoverRefused { fate_id: FateId, reason: String },

    /// Every attempt at a conditional write lost a version race.
    #[snafu(display("{fate_id} modified concurrently across {attempts} attempts"))]
    ConcurrentModification { fate_id: FateId, attempts: u32 },

    /// No unused transaction id could be allocated.
    #[snafu(display("could not allocate a transaction id after {attempts} attempts"))]
    IdAllocation { attempts: u32 },

    /// The status did not change to an expected value in time.
    #[snafu(display("{fate_id} did not reach an expected status within {timeout_ms}ms"))]
    WaitTimedOut { fate_id: FateId, timeout_ms: u64 },
}

impl FateError {
    /// Whether a retry after backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FateError::StoreUnavailable { .. } | FateError::ConcurrentModification { .. })
    }

    pub(crate) fn from_conditional(fate_id: FateId, operation: &'static str, err: ConditionalWriteError) -> Self {
        match err {
            ConditionalWriteError::Unavailable { source, .. } => FateError::StoreUnavailable { operation, source },
            ConditionalWriteError::RetriesExhausted { attempts, .. } => {
                FateError::ConcurrentModification { fate_id, attempts }
            }
        }
    }
}
