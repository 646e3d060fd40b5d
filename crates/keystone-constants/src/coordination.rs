//! Coordination service interaction bounds.

/// Maximum CAS attempts before a conditional write gives up (100).
///
/// Tiger Style: Bounded retries prevent livelock under heavy contention.
pub const MAX_CAS_RETRIES: u32 = 100;

/// Initial backoff after a lost CAS race in milliseconds.
pub const CAS_RETRY_INITIAL_BACKOFF_MS: u64 = 1;

/// Ceiling for exponential CAS backoff in milliseconds.
pub const CAS_RETRY_MAX_BACKOFF_MS: u64 = 128;

/// Default bound on a single coordination round-trip (10 seconds).
///
/// A stuck coordination service surfaces as an unavailable store after this
/// long instead of wedging the calling worker.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Upper bound accepted for a configured per-call timeout (5 minutes).
pub const MAX_OPERATION_TIMEOUT_MS: u64 = 300_000;
