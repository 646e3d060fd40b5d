//! Shared setup for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keystone::KeystoneConfig;
use keystone::MetaFateStore;
use keystone::MetadataStore;
use keystone_testing::DeterministicCoordinationClient;

/// Standard bound for waits inside tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const INSTANCE_ROOT: &str = "/keystone/it";

pub fn test_config() -> KeystoneConfig {
    KeystoneConfig {
        instance_root: INSTANCE_ROOT.to_string(),
        ..KeystoneConfig::default()
    }
}

/// A transaction store over a fresh in-memory coordination service.
pub async fn setup_fate_store() -> Result<(
    Arc<DeterministicCoordinationClient>,
    Arc<MetaFateStore<DeterministicCoordinationClient>>,
)> {
    keystone::init_tracing();
    let config = test_config();
    let client = DeterministicCoordinationClient::new();
    let store = MetaFateStore::open(client.clone(), &config.instance_root, config.fate_store_config()).await?;
    Ok((client, Arc::new(store)))
}

/// Another worker's transaction store over the same coordination service,
/// with its own reservation cache.
pub async fn open_peer_fate_store(
    client: &Arc<DeterministicCoordinationClient>,
    config: &KeystoneConfig,
) -> Result<MetaFateStore<DeterministicCoordinationClient>> {
    Ok(MetaFateStore::open(client.clone(), &config.instance_root, config.fate_store_config()).await?)
}

/// A metadata store over a fresh in-memory coordination service.
pub async fn setup_metadata_store() -> Result<(Arc<DeterministicCoordinationClient>, Arc<MetadataStore>)> {
    keystone::init_tracing();
    let config = test_config();
    let client = DeterministicCoordinationClient::new();
    let store = MetadataStore::open(client.clone(), &config.instance_root, config.operation_timeout()).await?;
    Ok((client, Arc::new(store)))
}
