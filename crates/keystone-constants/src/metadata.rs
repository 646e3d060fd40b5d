//! Tablet metadata constants.

/// Path segment under the instance root holding tablet metadata records.
pub const ZMETADATA: &str = "/metadata";

/// Capacity of a tablet state store's notification queue (1,000 events).
///
/// Producers fail fast once the queue is full; they never block.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1_000;

/// Maximum tablets accepted in a single conditional mutation batch.
pub const MAX_MUTATION_BATCH_SIZE: usize = 10_000;
