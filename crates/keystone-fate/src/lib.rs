//! Durable, crash-recoverable store of long-running transactions.
//!
//! Each transaction is a record of `(status, payload, reservation)` kept in
//! one coordination node. Workers claim a transaction with [`MetaFateStore::reserve`],
//! drive it forward with [`MetaFateStore::set_status`] and
//! [`MetaFateStore::set_payload`], release it with [`MetaFateStore::unreserve`]
//! and finally [`MetaFateStore::delete`] it once terminal.
//!
//! At most one worker holds a reservation at a time. A worker that dies while
//! holding one is recovered either through
//! [`MetaFateStore::delete_dead_reservations`] (liveness known) or the
//! explicit, policy-gated [`MetaFateStore::take_over_stale`].
//!
//! The record layout lives in [`codec`] and is usable on its own.

pub mod codec;
mod error;
mod reservation;
mod store;
mod types;

pub use codec::CodecError;
pub use codec::NodeHeader;
pub use codec::NodeValue;
pub use error::FateError;
pub use reservation::ReservationTakeoverPolicy;
pub use store::FateStoreConfig;
pub use store::MetaFateStore;
pub use types::FateId;
pub use types::FateIdGenerator;
pub use types::FateIdStatus;
pub use types::FateInstanceType;
pub use types::FateReservation;
pub use types::InvalidOwnerIdError;
pub use types::OwnerId;
pub use types::ParseFateIdError;
pub use types::RandomFateIdGenerator;
pub use types::TStatus;
