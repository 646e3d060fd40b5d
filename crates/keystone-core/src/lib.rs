//! Shared building blocks for keystone stores.
//!
//! - [`ConditionalWriter`]: the read, decide, version-CAS loop that both the
//!   transaction reservation protocol and the tablet metadata mutator use
//! - [`bounded`]: per-call timeout wrapper so a stuck coordination service
//!   never wedges a caller
//! - [`now_unix_ms`]: wall clock used for reservation and suspension stamps

mod conditional;
mod error;
mod time;

pub use conditional::ConditionalWrite;
pub use conditional::ConditionalWriter;
pub use conditional::MutationOutcome;
pub use conditional::WriteDecision;
pub use error::ConditionalWriteError;
pub use time::bounded;
pub use time::now_unix_ms;
