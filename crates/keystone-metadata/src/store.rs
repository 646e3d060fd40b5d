//! Tablet metadata records in the coordination service.
//!
//! Records live at `<root>/metadata/<level>/<metadata row>` as JSON.

use std::sync::Arc;
use std::time::Duration;

use keystone_constants::ZMETADATA;
use keystone_core::bounded;
use keystone_kv_types::CoordinationClientError;
use keystone_kv_types::CreateMode;
use keystone_kv_types::NodeData;
use keystone_kv_types::join_path;
use keystone_traits::CoordinationClient;
use snafu::ResultExt;
use tracing::debug;

use crate::error::MalformedRecordSnafu;
use crate::error::MetadataError;
use crate::error::StoreUnavailableSnafu;
use crate::extent::KeyExtent;
use crate::mutator::ConditionalTabletsMutator;
use crate::tablet::DataLevel;
use crate::tablet::TabletMetadata;

/// Access to the tablet metadata namespace.
pub struct MetadataStore {
    client: Arc<dyn CoordinationClient>,
    metadata_root: String,
    timeout: Duration,
}

impl MetadataStore {
    /// Open the namespace under `instance_root`, creating a directory per level.
    pub async fn open(
        client: Arc<dyn CoordinationClient>,
        instance_root: &str,
        timeout: Duration,
    ) -> Result<Self, MetadataError> {
        let metadata_root = join_path(instance_root, ZMETADATA);
        for level in DataLevel::ALL {
            let path = join_path(&metadata_root, level.as_str());
            bounded(timeout, client.ensure_path(&path)).await.context(StoreUnavailableSnafu { operation: "open" })?;
        }
        debug!(metadata_root = %metadata_root, "opened metadata store");
        Ok(Self {
            client,
            metadata_root,
            timeout,
        })
    }

    pub fn client(&self) -> &dyn CoordinationClient {
        self.client.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn level_path(&self, level: DataLevel) -> String {
        join_path(&self.metadata_root, level.as_str())
    }

    pub fn tablet_path(&self, level: DataLevel, extent: &KeyExtent) -> String {
        join_path(&self.level_path(level), &extent.metadata_row())
    }

    /// Write a tablet record unconditionally, creating it if needed.
    pub async fn put_tablet(&self, level: DataLevel, tablet: &TabletMetadata) -> Result<(), MetadataError> {
        let path = self.tablet_path(level, &tablet.extent);
        let data = encode_tablet(tablet);
        let created = bounded(self.timeout, self.client.create(&path, data.clone(), CreateMode::Persistent)).await;
        match created {
            Ok(_) => Ok(()),
            Err(CoordinationClientError::NodeExists { .. }) => {
                bounded(self.timeout, self.client.set(&path, data, None))
                    .await
                    .context(StoreUnavailableSnafu { operation: "put_tablet" })?;
                Ok(())
            }
            Err(source) => Err(MetadataError::StoreUnavailable {
                operation: "put_tablet",
                source,
            }),
        }
    }

    /// Read one tablet record, `None` if absent.
    pub async fn read_tablet(
        &self,
        level: DataLevel,
        extent: &KeyExtent,
    ) -> Result<Option<TabletMetadata>, MetadataError> {
        let path = self.tablet_path(level, extent);
        match bounded(self.timeout, self.client.read(&path)).await {
            Ok(node) => decode_tablet(&path, &node).map(Some),
            Err(CoordinationClientError::NoNode { .. }) => Ok(None),
            Err(source) => Err(MetadataError::StoreUnavailable {
                operation: "read_tablet",
                source,
            }),
        }
    }

    /// Point-in-time scan of every tablet at `level`, in metadata row order.
    ///
    /// Records removed between listing and reading are skipped.
    pub async fn scan_tablets(&self, level: DataLevel) -> Result<Vec<TabletMetadata>, MetadataError> {
        let level_path = self.level_path(level);
        let mut rows = bounded(self.timeout, self.client.list_children(&level_path))
            .await
            .context(StoreUnavailableSnafu { operation: "scan_tablets" })?;
        rows.sort();

        let mut tablets = Vec::with_capacity(rows.len());
        for row in rows {
            let path = join_path(&level_path, &row);
            match bounded(self.timeout, self.client.read(&path)).await {
                Ok(node) => tablets.push(decode_tablet(&path, &node)?),
                Err(CoordinationClientError::NoNode { .. }) => continue,
                Err(source) => {
                    return Err(MetadataError::StoreUnavailable {
                        operation: "scan_tablets",
                        source,
                    });
                }
            }
        }
        Ok(tablets)
    }

    /// Start a batch of conditional mutations against `level`.
    pub fn conditionally_mutate_tablets(&self, level: DataLevel) -> ConditionalTabletsMutator<'_> {
        ConditionalTabletsMutator::new(self, level)
    }
}

pub(crate) fn encode_tablet(tablet: &TabletMetadata) -> Vec<u8> {
    // Only plain data types, serialization cannot fail.
    serde_json::to_vec(tablet).unwrap_or_default()
}

pub(crate) fn decode_tablet(path: &str, node: &NodeData) -> Result<TabletMetadata, MetadataError> {
    serde_json::from_slice(&node.data).context(MalformedRecordSnafu { path })
}
