//! Management scan over one metadata level.
//!
//! A scan yields queued state-change notifications first, then tablets from a
//! point-in-time range scan that need attention. Once the range is exhausted
//! it keeps waiting on the notification queue until closed.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use futures::stream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MetadataError;
use crate::store::MetadataStore;
use crate::tablet::DataLevel;
use crate::tablet::TabletManagement;

/// Receiving half of a state store's notification queue, shared by every scan.
pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<TabletManagement>>>;

/// Pull-based stream of tablets needing management.
pub struct TabletManagementScanner {
    store: Arc<MetadataStore>,
    level: DataLevel,
    queue: SharedQueue,
    range: VecDeque<TabletManagement>,
    range_loaded: bool,
    closed: CancellationToken,
}

impl TabletManagementScanner {
    pub(crate) fn new(store: Arc<MetadataStore>, level: DataLevel, queue: SharedQueue) -> Self {
        Self {
            store,
            level,
            queue,
            range: VecDeque::new(),
            range_loaded: false,
            closed: CancellationToken::new(),
        }
    }

    /// Stop the scan. A pending [`next`](Self::next) returns `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token that closes this scan when cancelled, for use from another task.
    pub fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Next tablet needing management, waiting on the queue once the range
    /// scan is exhausted. Returns `None` after [`close`](Self::close).
    ///
    /// A failed range scan is reported once; the scan then continues on the
    /// queue alone.
    pub async fn next(&mut self) -> Result<Option<TabletManagement>, MetadataError> {
        if self.is_closed() {
            return Ok(None);
        }
        if let Some(event) = self.try_next_queued() {
            return Ok(Some(event));
        }
        if !self.range_loaded {
            self.range_loaded = true;
            let tablets = self.store.scan_tablets(self.level).await?;
            self.range.extend(tablets.into_iter().filter_map(TabletManagement::from_scan));
            debug!(level = %self.level, pending = self.range.len(), "loaded management range scan");
            if let Some(event) = self.try_next_queued() {
                return Ok(Some(event));
            }
        }
        if let Some(tablet) = self.range.pop_front() {
            return Ok(Some(tablet));
        }

        let queue = self.queue.clone();
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            event = async move { queue.lock().await.recv().await } => Ok(event),
        }
    }

    /// Next tablet if one is available without waiting or I/O.
    ///
    /// Tablets from the range scan are only available after the first
    /// [`next`](Self::next) has loaded it.
    pub fn try_next(&mut self) -> Option<TabletManagement> {
        if self.is_closed() {
            return None;
        }
        self.try_next_queued().or_else(|| self.range.pop_front())
    }

    fn try_next_queued(&self) -> Option<TabletManagement> {
        // Another scan is waiting on the queue; nothing is immediately available.
        let mut queue = self.queue.try_lock().ok()?;
        match queue.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Adapt into a [`Stream`] that ends when the scan is closed.
    pub fn into_stream(self) -> impl Stream<Item = Result<TabletManagement, MetadataError>> + Send {
        stream::unfold(self, |mut scanner| async move {
            match scanner.next().await {
                Ok(Some(tablet)) => Some((Ok(tablet), scanner)),
                Ok(None) => None,
                Err(e) => Some((Err(e), scanner)),
            }
        })
    }
}
