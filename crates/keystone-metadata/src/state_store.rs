//! Tablet state stores: suspension transitions plus the notification queue
//! feeding management scans.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use keystone_constants::NOTIFICATION_QUEUE_CAPACITY;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::error::MetadataError;
use crate::extent::KeyExtent;
use crate::scanner::SharedQueue;
use crate::scanner::TabletManagementScanner;
use crate::store::MetadataStore;
use crate::tablet::DataLevel;
use crate::tablet::SuspensionMark;
use crate::tablet::TabletManagement;
use crate::tablet::TabletMetadata;

/// State store for the tablets of one [`DataLevel`].
#[async_trait]
pub trait TabletStateStore: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    fn level(&self) -> DataLevel;

    /// Enqueue a notification without blocking. Returns `false` if the queue is full.
    fn add_event(&self, event: TabletManagement) -> bool;

    /// Start a new management scan.
    fn scan(&self) -> TabletManagementScanner;

    /// Suspend each tablet to its current host at `suspension_timestamp_ms`,
    /// or clear suspensions when `None`.
    ///
    /// Tablets already in the desired state are skipped without any write.
    /// Tablets with no current host cannot be suspended and are skipped.
    /// Fails with `PartialApplyFailure` naming every tablet not accepted;
    /// accepted tablets stay applied. Fails with `StoreUnavailable` if the
    /// service could not be reached for any tablet.
    async fn apply_suspensions(
        &self,
        tablets: &[TabletMetadata],
        suspension_timestamp_ms: Option<u64>,
    ) -> Result<(), MetadataError>;

    async fn suspend(&self, tablets: &[TabletMetadata], timestamp_ms: u64) -> Result<(), MetadataError> {
        self.apply_suspensions(tablets, Some(timestamp_ms)).await
    }

    async fn unsuspend(&self, tablets: &[TabletMetadata]) -> Result<(), MetadataError> {
        self.apply_suspensions(tablets, None).await
    }
}

const DEFAULT_QUEUE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(NOTIFICATION_QUEUE_CAPACITY) {
    Some(capacity) => capacity,
    None => panic!("NOTIFICATION_QUEUE_CAPACITY must be non-zero"),
};

/// State store over tablet records kept in the coordination service.
pub struct MetaDataStateStore {
    store: Arc<MetadataStore>,
    level: DataLevel,
    events: mpsc::Sender<TabletManagement>,
    queue: SharedQueue,
}

impl MetaDataStateStore {
    pub fn new(store: Arc<MetadataStore>, level: DataLevel) -> Self {
        Self::with_queue_capacity(store, level, DEFAULT_QUEUE_CAPACITY)
    }

    /// State store whose notification queue holds at most `capacity` events.
    pub fn with_queue_capacity(store: Arc<MetadataStore>, level: DataLevel, capacity: NonZeroUsize) -> Self {
        let (events, queue) = mpsc::channel(capacity.get());
        Self {
            store,
            level,
            events,
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Notifications waiting to be scanned.
    pub fn queued_events(&self) -> usize {
        self.events.max_capacity() - self.events.capacity()
    }
}

#[async_trait]
impl TabletStateStore for MetaDataStateStore {
    fn name(&self) -> &'static str {
        "Normal Tablets"
    }

    fn level(&self) -> DataLevel {
        self.level
    }

    fn add_event(&self, event: TabletManagement) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                trace!(extent = %event.tablet.extent, "notification queue full");
                false
            }
            // The store holds the receiver, so the queue cannot close while it exists.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn scan(&self) -> TabletManagementScanner {
        TabletManagementScanner::new(self.store.clone(), self.level, self.queue.clone())
    }

    async fn apply_suspensions(
        &self,
        tablets: &[TabletMetadata],
        suspension_timestamp_ms: Option<u64>,
    ) -> Result<(), MetadataError> {
        let mut batch = self.store.conditionally_mutate_tablets(self.level);
        for tm in tablets {
            let desired = match suspension_timestamp_ms {
                Some(timestamp_ms) => match tm.current_server() {
                    Some(server) => Some(SuspensionMark::new(server.clone(), timestamp_ms)),
                    None => {
                        debug!(extent = %tm.extent, "tablet has no current location, not suspending");
                        continue;
                    }
                },
                None => None,
            };
            if tm.suspend == desired {
                continue;
            }

            let mutation = batch
                .mutate_tablet(tm.extent.clone())
                .require_absent_operation()
                .require_prev_end_row(tm.extent.prev_end_row.clone())
                .require_suspension(tm.suspend.clone());
            let mutation = match &desired {
                Some(mark) => mutation.put_suspension(mark.server.clone(), mark.timestamp_ms),
                None => mutation.delete_suspension(),
            };
            mutation.submit(move |written| written.suspend == desired);
        }

        if batch.is_empty() {
            return Ok(());
        }
        let submitted = batch.len();
        let results = batch.process().await?;
        let mut failed: Vec<KeyExtent> =
            results.into_values().filter(|r| !r.outcome.is_accepted()).map(|r| r.extent).collect();
        if failed.is_empty() {
            info!(store = self.name(), level = %self.level, tablets = submitted, suspend = suspension_timestamp_ms.is_some(), "applied suspension changes");
            return Ok(());
        }
        failed.sort();
        Err(MetadataError::PartialApplyFailure {
            accepted: submitted - failed.len(),
            failed,
        })
    }
}
