//! Clock and timeout helpers.

use std::future::Future;
use std::time::Duration;

use keystone_kv_types::CoordinationClientError;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch rather than panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Run one coordination round-trip, failing with `Timeout` after `limit`.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, CoordinationClientError>
where F: Future<Output = Result<T, CoordinationClientError>> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoordinationClientError::Timeout {
            duration_ms: limit.as_millis() as u64,
        }),
    }
}
