//! Transaction store over the coordination service.
//!
//! Each transaction is one node, `<root>/fate/tx_<uuid>`, holding an encoded
//! [`NodeValue`]. Every mutation is a single version-checked write through
//! [`ConditionalWriter`]; there are no held locks. The reservation written
//! into the record is the only mutual-exclusion primitive.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::StreamExt;
use futures::stream;
use keystone_constants::DEFAULT_OPERATION_TIMEOUT_MS;
use keystone_constants::MAX_FATE_ID_COLLISION_RETRIES;
use keystone_constants::MAX_RESERVATION_CACHE_ENTRIES;
use keystone_constants::ZFATE;
use keystone_constants::ZTABLE_LOCKS;
use keystone_core::ConditionalWrite;
use keystone_core::ConditionalWriter;
use keystone_core::MutationOutcome;
use keystone_core::WriteDecision;
use keystone_core::bounded;
use keystone_core::now_unix_ms;
use keystone_kv_types::CoordinationClientError;
use keystone_kv_types::CreateMode;
use keystone_kv_types::NodeData;
use keystone_kv_types::join_path;
use keystone_traits::CoordinationClient;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::codec::NodeHeader;
use crate::codec::NodeValue;
use crate::error::FateError;
use crate::error::MalformedRecordSnafu;
use crate::error::StoreUnavailableSnafu;
use crate::reservation::ReservationCache;
use crate::reservation::ReservationTakeoverPolicy;
use crate::types::FateId;
use crate::types::FateIdGenerator;
use crate::types::FateIdStatus;
use crate::types::FateInstanceType;
use crate::types::FateReservation;
use crate::types::OwnerId;
use crate::types::RandomFateIdGenerator;
use crate::types::TStatus;

/// Tunables for [`MetaFateStore`].
#[derive(Debug, Clone)]
pub struct FateStoreConfig {
    /// Bound on every coordination round-trip.
    pub operation_timeout_ms: u64,
    /// Forced takeover of stale reservations.
    pub takeover_policy: ReservationTakeoverPolicy,
    /// Capacity of the local reservation cache; 0 disables it.
    pub reservation_cache_entries: usize,
}

impl Default for FateStoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            takeover_policy: ReservationTakeoverPolicy::Disabled,
            reservation_cache_entries: MAX_RESERVATION_CACHE_ENTRIES,
        }
    }
}

/// Durable store of system transactions.
pub struct MetaFateStore<C: CoordinationClient + ?Sized> {
    client: Arc<C>,
    fate_root: String,
    config: FateStoreConfig,
    id_generator: Arc<dyn FateIdGenerator>,
    cache: ReservationCache,
}

impl<C: CoordinationClient + ?Sized> MetaFateStore<C> {
    /// Open the store under `instance_root`, creating its namespaces if missing.
    pub async fn open(client: Arc<C>, instance_root: &str, config: FateStoreConfig) -> Result<Self, FateError> {
        let fate_root = join_path(instance_root, ZFATE);
        let table_locks = join_path(instance_root, ZTABLE_LOCKS);
        let timeout = Duration::from_millis(config.operation_timeout_ms);
        for path in [&fate_root, &table_locks] {
            bounded(timeout, client.ensure_path(path)).await.context(StoreUnavailableSnafu { operation: "open" })?;
        }
        debug!(fate_root = %fate_root, "opened transaction store");

        let cache = ReservationCache::new(config.reservation_cache_entries.min(MAX_RESERVATION_CACHE_ENTRIES));
        Ok(Self {
            client,
            fate_root,
            config,
            id_generator: Arc::new(RandomFateIdGenerator),
            cache,
        })
    }

    /// Replace the id source (used to force collisions in tests).
    pub fn with_id_generator(mut self, id_generator: Arc<dyn FateIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn instance_type(&self) -> FateInstanceType {
        FateInstanceType::Meta
    }

    pub fn fate_root(&self) -> &str {
        &self.fate_root
    }

    pub fn takeover_policy(&self) -> ReservationTakeoverPolicy {
        self.config.takeover_policy
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }

    fn tx_path(&self, fate_id: &FateId) -> String {
        join_path(&self.fate_root, &fate_id.node_name())
    }

    /// Persist a fresh `NEW` transaction with no payload and no reservation.
    pub async fn create(&self) -> Result<FateId, FateError> {
        let data = NodeValue::new(TStatus::New).encode();
        for attempt in 1..=MAX_FATE_ID_COLLISION_RETRIES {
            let fate_id = self.id_generator.new_fate_id(self.instance_type());
            let path = self.tx_path(&fate_id);
            match bounded(self.timeout(), self.client.create(&path, data.clone(), CreateMode::Persistent)).await {
                Ok(stat) => {
                    self.cache.record(fate_id, NodeData { data, stat });
                    debug!(fate_id = %fate_id, "created transaction");
                    return Ok(fate_id);
                }
                Err(CoordinationClientError::NodeExists { .. }) => {
                    warn!(fate_id = %fate_id, attempt, "transaction id collision, allocating another");
                }
                Err(source) => return Err(FateError::StoreUnavailable { operation: "create", source }),
            }
        }
        Err(FateError::IdAllocation {
            attempts: MAX_FATE_ID_COLLISION_RETRIES,
        })
    }

    /// Claim exclusive execution rights for `owner`.
    ///
    /// Returns `false` if another owner holds the reservation or the
    /// transaction does not exist. Re-reserving by the current owner succeeds
    /// and refreshes the reservation time.
    pub async fn reserve(&self, fate_id: FateId, owner: &OwnerId) -> Result<bool, FateError> {
        let reservation = FateReservation::new(owner.clone(), now_unix_ms());
        let mut failure = None;
        let mut holder = None;
        let write = self
            .mutate(fate_id, "reserve", |node| {
                failure = None;
                holder = None;
                let mut value = match decode_existing(fate_id, node) {
                    Ok(Some(value)) => value,
                    Ok(None) => return WriteDecision::Reject("transaction does not exist".to_string()),
                    Err(e) => {
                        failure = Some(e);
                        return WriteDecision::Reject("malformed record".to_string());
                    }
                };
                match &value.reservation {
                    Some(current) if current.owner != *owner => {
                        holder = Some(current.owner.clone());
                        WriteDecision::Reject(format!("reserved by {}", current.owner))
                    }
                    _ => {
                        value.reservation = Some(reservation.clone());
                        WriteDecision::Put(value.encode())
                    }
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }

        if write.outcome.is_accepted() {
            debug!(fate_id = %fate_id, owner = %owner, "reserved transaction");
            return Ok(true);
        }
        match holder {
            Some(holder) => debug!(fate_id = %fate_id, owner = %owner, holder = %holder, "transaction reserved by another owner"),
            None => debug!(fate_id = %fate_id, owner = %owner, "cannot reserve absent transaction"),
        }
        Ok(false)
    }

    /// Release `owner`'s reservation.
    ///
    /// A no-op returning `false` if the transaction is absent, unreserved or
    /// reserved by someone else.
    pub async fn unreserve(&self, fate_id: FateId, owner: &OwnerId) -> Result<bool, FateError> {
        let mut failure = None;
        let write = self
            .mutate(fate_id, "unreserve", |node| {
                failure = None;
                let mut value = match decode_existing(fate_id, node) {
                    Ok(Some(value)) => value,
                    Ok(None) => return WriteDecision::Unchanged,
                    Err(e) => {
                        failure = Some(e);
                        return WriteDecision::Reject("malformed record".to_string());
                    }
                };
                match &value.reservation {
                    Some(current) if current.owner == *owner => {
                        value.reservation = None;
                        WriteDecision::Put(value.encode())
                    }
                    _ => WriteDecision::Unchanged,
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }

        let released = write.new_stat.is_some();
        if released {
            debug!(fate_id = %fate_id, owner = %owner, "released reservation");
        }
        Ok(released)
    }

    /// Current status; `Unknown` if the transaction does not exist.
    pub async fn get_status(&self, fate_id: FateId) -> Result<TStatus, FateError> {
        Ok(self.read_header(fate_id, "get_status").await?.map_or(TStatus::Unknown, |h| h.status))
    }

    /// Current reservation, if any.
    pub async fn get_reservation(&self, fate_id: FateId) -> Result<Option<FateReservation>, FateError> {
        Ok(self.read_header(fate_id, "get_reservation").await?.and_then(|h| h.reservation))
    }

    /// Move the transaction to `status`, keeping payload and reservation.
    ///
    /// `owner` must hold the reservation at write time.
    pub async fn set_status(&self, fate_id: FateId, owner: &OwnerId, status: TStatus) -> Result<(), FateError> {
        let mut failure = None;
        self.mutate(fate_id, "set_status", |node| {
            failure = None;
            let mut value = match decode_owned(fate_id, owner, node) {
                Ok(value) => value,
                Err(e) => {
                    failure = Some(e);
                    return WriteDecision::Reject("precondition failed".to_string());
                }
            };
            if !value.status.can_transition_to(status) {
                failure = Some(FateError::InvalidStatusTransition {
                    fate_id,
                    from: value.status,
                    to: status,
                });
                return WriteDecision::Reject("backward transition".to_string());
            }
            if value.status == status {
                return WriteDecision::Unchanged;
            }
            value.status = status;
            WriteDecision::Put(value.encode())
        })
        .await?;
        if let Some(e) = failure {
            return Err(e);
        }
        debug!(fate_id = %fate_id, owner = %owner, status = %status, "set transaction status");
        Ok(())
    }

    /// Replace the work payload. `owner` must hold the reservation.
    pub async fn set_payload(&self, fate_id: FateId, owner: &OwnerId, payload: Vec<u8>) -> Result<(), FateError> {
        let mut failure = None;
        self.mutate(fate_id, "set_payload", |node| {
            failure = None;
            let mut value = match decode_owned(fate_id, owner, node) {
                Ok(value) => value,
                Err(e) => {
                    failure = Some(e);
                    return WriteDecision::Reject("precondition failed".to_string());
                }
            };
            if value.payload.as_ref() == Some(&payload) {
                return WriteDecision::Unchanged;
            }
            value.payload = Some(payload.clone());
            WriteDecision::Put(value.encode())
        })
        .await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Work payload, `None` if absent or the transaction does not exist.
    pub async fn get_payload(&self, fate_id: FateId) -> Result<Option<Vec<u8>>, FateError> {
        let Some(node) = self.read_node(fate_id, "get_payload").await? else {
            return Ok(None);
        };
        let value = NodeValue::decode(&node.data).context(MalformedRecordSnafu { fate_id })?;
        Ok(value.payload)
    }

    /// Drop the payload, keeping status and reservation. Returns whether anything changed.
    pub async fn redact(&self, fate_id: FateId) -> Result<bool, FateError> {
        let mut failure = None;
        let write = self
            .mutate(fate_id, "redact", |node| {
                failure = None;
                let Some(node) = node else {
                    return WriteDecision::Unchanged;
                };
                let redacted = NodeValue::decode(&node.data).and_then(|value| match value.payload {
                    Some(_) => NodeValue::redact(&node.data).map(Some),
                    None => Ok(None),
                });
                match redacted {
                    Ok(Some(bytes)) => WriteDecision::Put(bytes),
                    Ok(None) => WriteDecision::Unchanged,
                    Err(source) => {
                        failure = Some(FateError::MalformedRecord { fate_id, source });
                        WriteDecision::Reject("malformed record".to_string())
                    }
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(write.new_stat.is_some())
    }

    /// Lazily enumerate transactions.
    ///
    /// The child listing is a point-in-time snapshot; each record is read
    /// when the stream reaches it, and records deleted in between are skipped.
    pub async fn list(&self) -> Result<impl Stream<Item = Result<FateIdStatus, FateError>> + '_, FateError> {
        let children = bounded(self.timeout(), self.client.list_children(&self.fate_root))
            .await
            .context(StoreUnavailableSnafu { operation: "list" })?;
        let instance_type = self.instance_type();
        let ids: Vec<FateId> =
            children.iter().filter_map(|name| FateId::from_node_name(instance_type, name)).collect();

        Ok(stream::iter(ids).filter_map(move |fate_id| async move {
            match self.read_header(fate_id, "list").await {
                Ok(Some(header)) => Some(Ok(FateIdStatus {
                    fate_id,
                    status: header.status,
                    reservation: header.reservation,
                })),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }

    /// Transactions whose status is in `filter` (all transactions if empty).
    pub async fn list_with_status(&self, filter: &[TStatus]) -> Result<Vec<FateIdStatus>, FateError> {
        let mut entries = std::pin::pin!(self.list().await?);
        let mut matched = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if filter.is_empty() || filter.contains(&entry.status) {
                matched.push(entry);
            }
        }
        Ok(matched)
    }

    /// Every currently reserved transaction with its reservation.
    pub async fn list_reservations(&self) -> Result<Vec<(FateId, FateReservation)>, FateError> {
        Ok(self
            .list_with_status(&[])
            .await?
            .into_iter()
            .filter_map(|entry| entry.reservation.map(|r| (entry.fate_id, r)))
            .collect())
    }

    /// Remove a finished transaction. Deleting an absent transaction is a no-op.
    pub async fn delete(&self, fate_id: FateId) -> Result<(), FateError> {
        let mut failure = None;
        let write = self
            .mutate(fate_id, "delete", |node| {
                failure = None;
                let Some(node) = node else {
                    return WriteDecision::Unchanged;
                };
                match NodeValue::decode_header(&node.data) {
                    Ok(header) if header.status.is_terminal() => WriteDecision::Delete,
                    Ok(header) => {
                        failure = Some(FateError::NotTerminal {
                            fate_id,
                            status: header.status,
                        });
                        WriteDecision::Reject("not terminal".to_string())
                    }
                    Err(source) => {
                        failure = Some(FateError::MalformedRecord { fate_id, source });
                        WriteDecision::Reject("malformed record".to_string())
                    }
                }
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }
        if write.wrote {
            debug!(fate_id = %fate_id, "deleted transaction");
        }
        Ok(())
    }

    /// Forcibly move a stale reservation from its holder to `new_owner`.
    ///
    /// Refused unless the takeover policy allows a reservation of
    /// `observed`'s age. Returns `false` if the record no longer carries
    /// exactly `observed`.
    pub async fn take_over_stale(
        &self,
        fate_id: FateId,
        new_owner: &OwnerId,
        observed: &FateReservation,
    ) -> Result<bool, FateError> {
        let now_ms = now_unix_ms();
        self.config
            .takeover_policy
            .check(observed, now_ms)
            .map_err(|reason| FateError::TakeoverRefused { fate_id, reason })?;

        let replacement = FateReservation::new(new_owner.clone(), now_ms);
        let mut failure = None;
        let write = self
            .mutate(fate_id, "take_over_stale", |node| {
                failure = None;
                let mut value = match decode_existing(fate_id, node) {
                    Ok(Some(value)) => value,
                    Ok(None) => return WriteDecision::Reject("transaction does not exist".to_string()),
                    Err(e) => {
                        failure = Some(e);
                        return WriteDecision::Reject("malformed record".to_string());
                    }
                };
                if value.reservation.as_ref() != Some(observed) {
                    return WriteDecision::Reject("reservation changed".to_string());
                }
                value.reservation = Some(replacement.clone());
                WriteDecision::Put(value.encode())
            })
            .await?;
        if let Some(e) = failure {
            return Err(e);
        }

        if write.new_stat.is_some() {
            warn!(
                fate_id = %fate_id,
                previous_owner = %observed.owner,
                new_owner = %new_owner,
                age_ms = observed.age_ms(now_ms),
                "forcibly took over stale reservation"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Clear reservations held by owners `is_live` reports as gone.
    ///
    /// Returns the number of reservations cleared.
    pub async fn delete_dead_reservations<F>(&self, is_live: F) -> Result<usize, FateError>
    where F: Fn(&OwnerId) -> bool {
        let mut cleared = 0;
        for (fate_id, reservation) in self.list_reservations().await? {
            if is_live(&reservation.owner) {
                continue;
            }
            let mut failure = None;
            let write = self
                .mutate(fate_id, "delete_dead_reservations", |node| {
                    failure = None;
                    let mut value = match decode_existing(fate_id, node) {
                        Ok(Some(value)) => value,
                        Ok(None) => return WriteDecision::Unchanged,
                        Err(e) => {
                            failure = Some(e);
                            return WriteDecision::Reject("malformed record".to_string());
                        }
                    };
                    if value.reservation.as_ref() != Some(&reservation) {
                        return WriteDecision::Unchanged;
                    }
                    value.reservation = None;
                    WriteDecision::Put(value.encode())
                })
                .await?;
            if let Some(e) = failure {
                return Err(e);
            }
            if write.new_stat.is_some() {
                info!(fate_id = %fate_id, owner = %reservation.owner, "cleared reservation of dead owner");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Wait until the status is one of `expected`, or the transaction disappears.
    ///
    /// Returns the observed status (`Unknown` on deletion).
    pub async fn wait_for_status_change(
        &self,
        fate_id: FateId,
        expected: &[TStatus],
        timeout: Duration,
    ) -> Result<TStatus, FateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let path = self.tx_path(&fate_id);
        let mut watch = bounded(self.timeout(), self.client.watch(&path))
            .await
            .context(StoreUnavailableSnafu { operation: "wait_for_status_change" })?;

        loop {
            bounded(self.timeout(), self.client.sync(&path))
                .await
                .context(StoreUnavailableSnafu { operation: "wait_for_status_change" })?;
            let status = self.get_status(fate_id).await?;
            if status == TStatus::Unknown || expected.contains(&status) {
                return Ok(status);
            }

            match tokio::time::timeout_at(deadline, watch.changed()).await {
                Ok(Some(event)) => debug!(fate_id = %fate_id, kind = ?event.kind, "transaction node changed"),
                Ok(None) => {
                    return Err(FateError::StoreUnavailable {
                        operation: "wait_for_status_change",
                        source: CoordinationClientError::ConnectionLoss {
                            reason: "watch closed".to_string(),
                        },
                    });
                }
                Err(_) => {
                    return Err(FateError::WaitTimedOut {
                        fate_id,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    async fn read_node(&self, fate_id: FateId, operation: &'static str) -> Result<Option<NodeData>, FateError> {
        match bounded(self.timeout(), self.client.read(&self.tx_path(&fate_id))).await {
            Ok(node) => {
                self.cache.record(fate_id, node.clone());
                Ok(Some(node))
            }
            Err(CoordinationClientError::NoNode { .. }) => {
                self.cache.invalidate(&fate_id);
                Ok(None)
            }
            Err(source) => Err(FateError::StoreUnavailable { operation, source }),
        }
    }

    async fn read_header(&self, fate_id: FateId, operation: &'static str) -> Result<Option<NodeHeader>, FateError> {
        let Some(node) = self.read_node(fate_id, operation).await? else {
            return Ok(None);
        };
        NodeValue::decode_header(&node.data).map(Some).context(MalformedRecordSnafu { fate_id })
    }

    /// Run one conditional write against a transaction node, keeping the
    /// reservation cache in step with what was observed or written.
    ///
    /// An ambiguous outcome is reported as `StoreUnavailable`.
    async fn mutate<F>(
        &self,
        fate_id: FateId,
        operation: &'static str,
        mut decide: F,
    ) -> Result<ConditionalWrite, FateError>
    where
        F: FnMut(Option<&NodeData>) -> WriteDecision {
        let path = self.tx_path(&fate_id);
        let mut written = None;
        let write = ConditionalWriter::new(&*self.client, &path, self.timeout())
            .with_snapshot(self.cache.get(&fate_id))
            .apply(|node| {
                let decision = decide(node);
                written = match &decision {
                    WriteDecision::Put(data) => Some(data.clone()),
                    _ => None,
                };
                decision
            })
            .await
            .map_err(|e| FateError::from_conditional(fate_id, operation, e))?;

        match (write.outcome, write.new_stat, written) {
            (MutationOutcome::Unknown, _, _) => {
                self.cache.invalidate(&fate_id);
                let source = write.failure.unwrap_or_else(|| CoordinationClientError::ConnectionLoss {
                    reason: "write outcome unknown".to_string(),
                });
                return Err(FateError::StoreUnavailable { operation, source });
            }
            (MutationOutcome::Accepted, Some(stat), Some(data)) => self.cache.record(fate_id, NodeData { data, stat }),
            (MutationOutcome::Accepted, None, _) if write.wrote => self.cache.invalidate(&fate_id),
            _ => match &write.observed {
                Some(node) => self.cache.record(fate_id, node.clone()),
                None => self.cache.invalidate(&fate_id),
            },
        }
        Ok(write)
    }
}

/// Decode a node if present.
fn decode_existing(fate_id: FateId, node: Option<&NodeData>) -> Result<Option<NodeValue>, FateError> {
    node.map(|node| NodeValue::decode(&node.data).context(MalformedRecordSnafu { fate_id })).transpose()
}

/// Decode a record and check that `owner` holds its reservation.
fn decode_owned(fate_id: FateId, owner: &OwnerId, node: Option<&NodeData>) -> Result<NodeValue, FateError> {
    let value = decode_existing(fate_id, node)?;
    let current = value.as_ref().and_then(|v| v.reservation.clone());
    match value {
        Some(value) if current.as_ref().is_some_and(|r| r.owner == *owner) => Ok(value),
        _ => Err(FateError::ReservationLost {
            fate_id,
            owner: owner.clone(),
            current,
        }),
    }
}

#[cfg(test)]
mod tests {
    use keystone_testing::DeterministicCoordinationClient;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;

    const ROOT: &str = "/keystone/instance-1";

    async fn open_store(
        config: FateStoreConfig,
    ) -> (Arc<DeterministicCoordinationClient>, MetaFateStore<DeterministicCoordinationClient>) {
        let client = DeterministicCoordinationClient::new();
        let store = MetaFateStore::open(client.clone(), ROOT, config).await.unwrap();
        (client, store)
    }

    fn owner(name: &str) -> OwnerId {
        OwnerId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_namespaces() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        assert_eq!(store.fate_root(), "/keystone/instance-1/fate");
        assert!(client.read("/keystone/instance-1/fate").await.is_ok());
        assert!(client.read("/keystone/instance-1/table-locks").await.is_ok());
    }

    #[tokio::test]
    async fn test_never_created_is_unknown() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = RandomFateIdGenerator.new_fate_id(FateInstanceType::Meta);
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::Unknown);
        assert_eq!(store.get_reservation(id).await.unwrap(), None);
        assert_eq!(store.get_payload(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_is_new_and_unreserved() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::New);
        assert_eq!(store.get_reservation(id).await.unwrap(), None);
        assert_eq!(store.get_payload(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive_and_idempotent() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();

        assert!(store.reserve(id, &owner("a")).await.unwrap());
        assert!(!store.reserve(id, &owner("b")).await.unwrap());
        assert!(store.reserve(id, &owner("a")).await.unwrap());
        assert_eq!(store.get_reservation(id).await.unwrap().unwrap().owner, owner("a"));
    }

    #[tokio::test]
    async fn test_reserve_absent_returns_false() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = RandomFateIdGenerator.new_fate_id(FateInstanceType::Meta);
        assert!(!store.reserve(id, &owner("a")).await.unwrap());
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unreserve_only_releases_own_reservation() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();

        assert!(!store.unreserve(id, &owner("a")).await.unwrap());
        assert!(store.reserve(id, &owner("a")).await.unwrap());
        assert!(!store.unreserve(id, &owner("b")).await.unwrap());
        assert!(store.unreserve(id, &owner("a")).await.unwrap());
        assert!(store.reserve(id, &owner("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_status_requires_reservation() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();

        let err = store.set_status(id, &owner("a"), TStatus::Submitted).await.unwrap_err();
        assert!(matches!(err, FateError::ReservationLost { current: None, .. }));

        store.reserve(id, &owner("b")).await.unwrap();
        let err = store.set_status(id, &owner("a"), TStatus::Submitted).await.unwrap_err();
        match err {
            FateError::ReservationLost { current: Some(r), .. } => assert_eq!(r.owner, owner("b")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::New);
    }

    #[tokio::test]
    async fn test_set_status_preserves_payload_and_reservation() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");
        store.reserve(id, &a).await.unwrap();
        store.set_payload(id, &a, b"compact table 7".to_vec()).await.unwrap();
        store.set_status(id, &a, TStatus::InProgress).await.unwrap();

        assert_eq!(store.get_status(id).await.unwrap(), TStatus::InProgress);
        assert_eq!(store.get_payload(id).await.unwrap(), Some(b"compact table 7".to_vec()));
        assert_eq!(store.get_reservation(id).await.unwrap().unwrap().owner, a);
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");
        store.reserve(id, &a).await.unwrap();
        store.set_status(id, &a, TStatus::InProgress).await.unwrap();

        let err = store.set_status(id, &a, TStatus::Submitted).await.unwrap_err();
        assert!(matches!(err, FateError::InvalidStatusTransition {
            from: TStatus::InProgress,
            to: TStatus::Submitted,
            ..
        }));
        let err = store.set_status(id, &a, TStatus::Unknown).await.unwrap_err();
        assert!(matches!(err, FateError::InvalidStatusTransition { .. }));
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_status() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");

        let err = store.delete(id).await.unwrap_err();
        assert!(matches!(err, FateError::NotTerminal { status: TStatus::New, .. }));

        store.reserve(id, &a).await.unwrap();
        store.set_status(id, &a, TStatus::InProgress).await.unwrap();
        store.set_status(id, &a, TStatus::Successful).await.unwrap();
        store.delete(id).await.unwrap();
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::Unknown);

        // Deleting again is a no-op.
        store.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_redact_keeps_status_and_reservation() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");
        store.reserve(id, &a).await.unwrap();
        store.set_payload(id, &a, vec![0xAB; 128]).await.unwrap();
        let before = store.get_reservation(id).await.unwrap();

        assert!(store.redact(id).await.unwrap());
        assert!(!store.redact(id).await.unwrap());
        assert_eq!(store.get_payload(id).await.unwrap(), None);
        assert_eq!(store.get_status(id).await.unwrap(), TStatus::New);
        assert_eq!(store.get_reservation(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_list_and_filter() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let a = owner("a");
        let first = store.create().await.unwrap();
        let second = store.create().await.unwrap();
        store.reserve(second, &a).await.unwrap();
        store.set_status(second, &a, TStatus::Submitted).await.unwrap();
        // Unrelated children are ignored.
        client.create(&join_path(store.fate_root(), "lock-0001"), Vec::new(), CreateMode::Persistent).await.unwrap();

        let all = store.list_with_status(&[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let submitted = store.list_with_status(&[TStatus::Submitted]).await.unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].fate_id, second);

        let reservations = store.list_reservations().await.unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].0, second);
        assert!(all.iter().any(|e| e.fate_id == first && e.status == TStatus::New));
    }

    #[tokio::test]
    async fn test_list_stream_counts_records() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        for _ in 0..5 {
            store.create().await.unwrap();
        }
        let count = store.list().await.unwrap().count().await;
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_takeover_disabled_by_default() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        store.reserve(id, &owner("a")).await.unwrap();
        let observed = store.get_reservation(id).await.unwrap().unwrap();

        let err = store.take_over_stale(id, &owner("b"), &observed).await.unwrap_err();
        assert!(matches!(err, FateError::TakeoverRefused { .. }));
    }

    #[tokio::test]
    async fn test_takeover_after_age() {
        let config = FateStoreConfig {
            takeover_policy: ReservationTakeoverPolicy::AfterAge {
                threshold_ms: 0,
                clock_skew_allowance_ms: 0,
            },
            ..FateStoreConfig::default()
        };
        let (_client, store) = open_store(config).await;
        let id = store.create().await.unwrap();
        let (a, b) = (owner("a"), owner("b"));
        store.reserve(id, &a).await.unwrap();
        let observed = store.get_reservation(id).await.unwrap().unwrap();

        assert!(store.take_over_stale(id, &b, &observed).await.unwrap());
        assert_eq!(store.get_reservation(id).await.unwrap().unwrap().owner, b);

        // The previous owner notices on its next write.
        let err = store.set_status(id, &a, TStatus::InProgress).await.unwrap_err();
        assert!(matches!(err, FateError::ReservationLost { .. }));

        // A second takeover with the old observation no longer matches.
        assert!(!store.take_over_stale(id, &owner("c"), &observed).await.unwrap());
    }

    #[tokio::test]
    async fn test_takeover_refused_when_too_young() {
        let config = FateStoreConfig {
            takeover_policy: ReservationTakeoverPolicy::AfterAge {
                threshold_ms: 60_000,
                clock_skew_allowance_ms: 5_000,
            },
            ..FateStoreConfig::default()
        };
        let (_client, store) = open_store(config).await;
        let id = store.create().await.unwrap();
        store.reserve(id, &owner("a")).await.unwrap();
        let observed = store.get_reservation(id).await.unwrap().unwrap();

        let err = store.take_over_stale(id, &owner("b"), &observed).await.unwrap_err();
        assert!(matches!(err, FateError::TakeoverRefused { .. }));
    }

    #[tokio::test]
    async fn test_delete_dead_reservations() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let live = owner("live");
        let dead = owner("dead");
        let kept = store.create().await.unwrap();
        let orphaned = store.create().await.unwrap();
        store.reserve(kept, &live).await.unwrap();
        store.reserve(orphaned, &dead).await.unwrap();

        let cleared = store.delete_dead_reservations(|o| *o == live).await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(store.get_reservation(orphaned).await.unwrap(), None);
        assert!(store.get_reservation(kept).await.unwrap().is_some());
        assert!(store.reserve(orphaned, &live).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_status_change() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let store = Arc::new(store);
        let id = store.create().await.unwrap();
        let a = owner("a");
        store.reserve(id, &a).await.unwrap();

        let writer = {
            let store = store.clone();
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.set_status(id, &a, TStatus::InProgress).await.unwrap();
            })
        };

        let status = store
            .wait_for_status_change(id, &[TStatus::InProgress, TStatus::Failed], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, TStatus::InProgress);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_status_change_times_out() {
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let err = store
            .wait_for_status_change(id, &[TStatus::Successful], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FateError::WaitTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_service_is_store_unavailable() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        client.set_available(false);

        assert!(matches!(store.create().await.unwrap_err(), FateError::StoreUnavailable { .. }));
        assert!(matches!(store.get_status(id).await.unwrap_err(), FateError::StoreUnavailable { .. }));
        let err = store.reserve(id, &owner("a")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_ambiguous_reserve_is_retry_safe() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");

        client.fail_writes_after_apply(1);
        let err = store.reserve(id, &a).await.unwrap_err();
        assert!(matches!(err, FateError::StoreUnavailable { operation: "reserve", .. }));

        // The write landed; retrying as the same owner is idempotent.
        assert!(store.reserve(id, &a).await.unwrap());
        assert!(!store.reserve(id, &owner("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_snapshot_skips_read() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let a = owner("a");

        client.reset_counters();
        assert!(store.reserve(id, &a).await.unwrap());
        assert!(store.unreserve(id, &a).await.unwrap());
        assert_eq!(client.read_count(), 0);
        assert_eq!(client.write_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_cache_recovers() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let path = join_path(store.fate_root(), &id.node_name());
        // Bump the version behind the store's back.
        let node = client.read(&path).await.unwrap();
        client.set(&path, node.data, None).await.unwrap();

        assert!(store.reserve(id, &owner("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_record_surfaced() {
        let (client, store) = open_store(FateStoreConfig::default()).await;
        let id = store.create().await.unwrap();
        let path = join_path(store.fate_root(), &id.node_name());
        client.set(&path, b"garbage".to_vec(), None).await.unwrap();

        assert!(matches!(store.get_status(id).await.unwrap_err(), FateError::MalformedRecord { .. }));
        assert!(matches!(store.reserve(id, &owner("a")).await.unwrap_err(), FateError::MalformedRecord { .. }));
    }

    struct ScriptedIds(Mutex<Vec<Uuid>>);

    impl FateIdGenerator for ScriptedIds {
        fn new_fate_id(&self, instance_type: FateInstanceType) -> FateId {
            let mut ids = self.0.lock();
            let uuid = if ids.len() > 1 { ids.remove(0) } else { ids[0] };
            FateId::new(instance_type, uuid)
        }
    }

    #[tokio::test]
    async fn test_create_retries_on_collision() {
        let taken = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let store = store.with_id_generator(Arc::new(ScriptedIds(Mutex::new(vec![taken, taken, fresh]))));

        let first = store.create().await.unwrap();
        assert_eq!(first.tx_uuid, taken);
        let second = store.create().await.unwrap();
        assert_eq!(second.tx_uuid, fresh);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_repeated_collisions() {
        let taken = Uuid::new_v4();
        let (_client, store) = open_store(FateStoreConfig::default()).await;
        let store = store.with_id_generator(Arc::new(ScriptedIds(Mutex::new(vec![taken]))));

        store.create().await.unwrap();
        let err = store.create().await.unwrap_err();
        assert!(matches!(err, FateError::IdAllocation { .. }));
    }
}
