//! Centralized constants for the keystone transaction and metadata stores.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Each constant has explicit bounds to prevent unbounded resource allocation.
//!
//! # Modules
//!
//! - [`coordination`]: CAS retry/backoff and per-call timeouts
//! - [`fate`]: Transaction store layout and reservation cache bounds
//! - [`metadata`]: Tablet metadata layout and notification queue bounds

pub mod coordination;
pub mod fate;
pub mod metadata;

// CAS retry constants
pub use coordination::CAS_RETRY_INITIAL_BACKOFF_MS;
pub use coordination::CAS_RETRY_MAX_BACKOFF_MS;
pub use coordination::DEFAULT_OPERATION_TIMEOUT_MS;
pub use coordination::MAX_CAS_RETRIES;
pub use coordination::MAX_OPERATION_TIMEOUT_MS;
pub use fate::MAX_FATE_ID_COLLISION_RETRIES;
pub use fate::MAX_RESERVATION_CACHE_ENTRIES;
pub use fate::ZFATE;
pub use fate::ZTABLE_LOCKS;
pub use metadata::NOTIFICATION_QUEUE_CAPACITY;
pub use metadata::ZMETADATA;
