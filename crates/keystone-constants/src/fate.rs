//! Transaction store constants.

/// Path segment under the instance root holding one node per transaction.
pub const ZFATE: &str = "/fate";

/// Path segment under the instance root reserved for table lock bookkeeping.
pub const ZTABLE_LOCKS: &str = "/table-locks";

/// Prefix of every transaction node name (`tx_<uuid>`).
pub const TX_NODE_PREFIX: &str = "tx_";

/// Attempts at allocating a fresh transaction id before giving up.
pub const MAX_FATE_ID_COLLISION_RETRIES: u32 = 10;

/// Maximum transactions tracked by the local reservation cache (10,000).
///
/// Tiger Style: The cache is an optimisation only; overflowing it evicts
/// entries rather than growing without bound.
pub const MAX_RESERVATION_CACHE_ENTRIES: usize = 10_000;

/// Maximum length in bytes of an encoded reservation owner identifier.
pub const MAX_OWNER_ID_LEN: usize = u16::MAX as usize;
