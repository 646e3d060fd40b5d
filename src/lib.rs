//! Keystone: a durable transaction store and conditional tablet metadata
//! mutation over a hierarchical coordination service.
//!
//! The building blocks live in their own crates and are re-exported here:
//!
//! - [`fate`]: the system transaction store ([`MetaFateStore`])
//! - [`metadata`]: conditional tablet mutation and tablet state stores
//! - [`config`]: layered configuration (environment, TOML, overrides)
//! - [`logging`]: `tracing` subscriber setup for binaries and tests

pub mod config;
pub mod logging;

pub use config::ConfigError;
pub use config::KeystoneConfig;
pub use keystone_core::MutationOutcome;
pub use keystone_fate as fate;
pub use keystone_fate::FateError;
pub use keystone_fate::FateId;
pub use keystone_fate::MetaFateStore;
pub use keystone_fate::OwnerId;
pub use keystone_fate::TStatus;
pub use keystone_kv_types::CoordinationClientError;
pub use keystone_metadata as metadata;
pub use keystone_metadata::MetaDataStateStore;
pub use keystone_metadata::MetadataError;
pub use keystone_metadata::MetadataStore;
pub use keystone_metadata::TabletStateStore;
pub use keystone_traits::CoordinationClient;
pub use logging::init_tracing;
