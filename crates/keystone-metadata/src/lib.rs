//! Tablet metadata, conditional mutation, and tablet state stores.
//!
//! # Overview
//!
//! - [`MetadataStore`]: tablet records in the coordination service, one JSON
//!   node per tablet under `<root>/metadata/<level>/`
//! - [`ConditionalTabletsMutator`]: batches per-tablet mutations guarded by
//!   preconditions and reports a [`ConditionalResult`] for each tablet
//! - [`MetaDataStateStore`]: applies suspension changes through the mutator
//!   and owns the bounded notification queue read by
//!   [`TabletManagementScanner`]
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(MetadataStore::open(client, "/keystone/instance", timeout).await?);
//! let state = MetaDataStateStore::new(store, DataLevel::User);
//! state.suspend(&tablets, now_unix_ms()).await?;
//! ```

mod error;
mod extent;
mod mutator;
mod scanner;
mod state_store;
mod store;
mod tablet;

pub use error::MetadataError;
pub use extent::KeyExtent;
pub use mutator::ConditionalResult;
pub use mutator::ConditionalTabletMutator;
pub use mutator::ConditionalTabletsMutator;
pub use mutator::TabletCondition;
pub use mutator::TabletDelta;
pub use scanner::TabletManagementScanner;
pub use state_store::MetaDataStateStore;
pub use state_store::TabletStateStore;
pub use store::MetadataStore;
pub use tablet::DataLevel;
pub use tablet::Location;
pub use tablet::LocationType;
pub use tablet::ManagementAction;
pub use tablet::ServerInstance;
pub use tablet::SuspensionMark;
pub use tablet::TabletManagement;
pub use tablet::TabletMetadata;
