//! Batched conditional mutation of tablet metadata.
//!
//! Each tablet in a batch is written with its own version-checked write;
//! there is no atomicity across tablets. A batch reports one
//! [`ConditionalResult`] per tablet and accepted tablets are never rolled
//! back, so each tablet's conditions must make a retry safe on their own.

use std::collections::HashMap;
use std::collections::HashSet;

use futures::future::join_all;
use keystone_constants::metadata::MAX_MUTATION_BATCH_SIZE;
use keystone_core::ConditionalWriteError;
use keystone_core::ConditionalWriter;
use keystone_core::MutationOutcome;
use keystone_core::WriteDecision;
use keystone_kv_types::CoordinationClientError;
use tracing::debug;
use tracing::warn;

use crate::error::MetadataError;
use crate::extent::KeyExtent;
use crate::store::MetadataStore;
use crate::store::decode_tablet;
use crate::store::encode_tablet;
use crate::tablet::DataLevel;
use crate::tablet::ServerInstance;
use crate::tablet::SuspensionMark;
use crate::tablet::TabletMetadata;

/// A precondition evaluated against the stored tablet at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabletCondition {
    /// No operation holds the tablet.
    AbsentOperation,
    /// The tablet's previous end row is exactly this.
    PrevEndRow(Option<Vec<u8>>),
    /// The tablet's suspension mark is exactly this.
    Suspension(Option<SuspensionMark>),
}

impl TabletCondition {
    fn check(&self, tablet: &TabletMetadata) -> Result<(), String> {
        match self {
            TabletCondition::AbsentOperation => match &tablet.operation_id {
                None => Ok(()),
                Some(op) => Err(format!("operation {op} pending")),
            },
            TabletCondition::PrevEndRow(expected) if tablet.extent.prev_end_row == *expected => Ok(()),
            TabletCondition::PrevEndRow(_) => Err("previous end row changed".to_string()),
            TabletCondition::Suspension(expected) if tablet.suspend == *expected => Ok(()),
            TabletCondition::Suspension(_) => Err("suspension changed".to_string()),
        }
    }
}

/// A change to apply when all conditions hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabletDelta {
    PutSuspension(SuspensionMark),
    DeleteSuspension,
}

impl TabletDelta {
    fn apply(&self, tablet: &mut TabletMetadata) {
        match self {
            TabletDelta::PutSuspension(mark) => tablet.suspend = Some(mark.clone()),
            TabletDelta::DeleteSuspension => tablet.suspend = None,
        }
    }
}

type AcceptancePredicate = Box<dyn Fn(&TabletMetadata) -> bool + Send + Sync>;

struct PendingMutation {
    extent: KeyExtent,
    conditions: Vec<TabletCondition>,
    deltas: Vec<TabletDelta>,
    predicate: Option<AcceptancePredicate>,
}

/// Outcome of one tablet's mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalResult {
    pub extent: KeyExtent,
    pub outcome: MutationOutcome,
    /// Result of the caller's acceptance check on the written state.
    ///
    /// `None` unless the mutation was accepted. A `false` here is logged and
    /// does not change `outcome`.
    pub predicate_held: Option<bool>,
    /// Why the mutation was not accepted.
    pub reason: Option<String>,
}

/// A batch of conditional tablet mutations at one [`DataLevel`].
pub struct ConditionalTabletsMutator<'s> {
    store: &'s MetadataStore,
    level: DataLevel,
    pending: Vec<PendingMutation>,
}

impl<'s> ConditionalTabletsMutator<'s> {
    pub(crate) fn new(store: &'s MetadataStore, level: DataLevel) -> Self {
        Self {
            store,
            level,
            pending: Vec::new(),
        }
    }

    /// Begin declaring a mutation of `extent`. Nothing is queued until
    /// [`ConditionalTabletMutator::submit`].
    pub fn mutate_tablet(&mut self, extent: KeyExtent) -> ConditionalTabletMutator<'_> {
        ConditionalTabletMutator {
            batch: &mut self.pending,
            mutation: PendingMutation {
                extent,
                conditions: Vec::new(),
                deltas: Vec::new(),
                predicate: None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Submit every queued mutation and collect per-tablet outcomes.
    ///
    /// Tablets are written concurrently with no ordering between them. Fails
    /// with `StoreUnavailable` if no tablet in the batch could be read.
    pub async fn process(self) -> Result<HashMap<KeyExtent, ConditionalResult>, MetadataError> {
        if self.pending.len() > MAX_MUTATION_BATCH_SIZE {
            return Err(MetadataError::BatchTooLarge {
                size: self.pending.len(),
                max: MAX_MUTATION_BATCH_SIZE,
            });
        }
        let mut seen = HashSet::with_capacity(self.pending.len());
        for mutation in &self.pending {
            if !seen.insert(&mutation.extent) {
                return Err(MetadataError::DuplicateMutation {
                    extent: mutation.extent.clone(),
                });
            }
        }

        let store = self.store;
        let level = self.level;
        let applied = join_all(self.pending.into_iter().map(|m| apply_one(store, level, m))).await;

        let mut results = HashMap::with_capacity(applied.len());
        let mut unreachable = None;
        let mut any_reached = false;
        for (result, read_failure) in applied {
            match read_failure {
                Some(source) => {
                    unreachable.get_or_insert(source);
                }
                None => any_reached = true,
            }
            results.insert(result.extent.clone(), result);
        }
        // Nothing in the batch could even be read, so nothing was written.
        if !any_reached && let Some(source) = unreachable {
            return Err(MetadataError::StoreUnavailable {
                operation: "conditionally_mutate_tablets",
                source,
            });
        }
        Ok(results)
    }
}

/// Builder for one tablet's conditions and changes.
#[must_use = "a tablet mutation is discarded unless submitted"]
pub struct ConditionalTabletMutator<'b> {
    batch: &'b mut Vec<PendingMutation>,
    mutation: PendingMutation,
}

impl ConditionalTabletMutator<'_> {
    pub fn require_absent_operation(mut self) -> Self {
        self.mutation.conditions.push(TabletCondition::AbsentOperation);
        self
    }

    pub fn require_prev_end_row(mut self, prev_end_row: Option<Vec<u8>>) -> Self {
        self.mutation.conditions.push(TabletCondition::PrevEndRow(prev_end_row));
        self
    }

    pub fn require_suspension(mut self, suspension: Option<SuspensionMark>) -> Self {
        self.mutation.conditions.push(TabletCondition::Suspension(suspension));
        self
    }

    pub fn put_suspension(mut self, server: ServerInstance, timestamp_ms: u64) -> Self {
        self.mutation.deltas.push(TabletDelta::PutSuspension(SuspensionMark::new(server, timestamp_ms)));
        self
    }

    pub fn delete_suspension(mut self) -> Self {
        self.mutation.deltas.push(TabletDelta::DeleteSuspension);
        self
    }

    /// Queue the mutation. `accepted` is run against the written state if the
    /// mutation is accepted, as a local sanity check.
    pub fn submit<P>(mut self, accepted: P)
    where P: Fn(&TabletMetadata) -> bool + Send + Sync + 'static {
        self.mutation.predicate = Some(Box::new(accepted));
        self.batch.push(self.mutation);
    }
}

/// Apply one tablet's mutation. The second element carries the client error
/// when the tablet could not be read, in which case nothing was written.
async fn apply_one(
    store: &MetadataStore,
    level: DataLevel,
    mutation: PendingMutation,
) -> (ConditionalResult, Option<CoordinationClientError>) {
    let path = store.tablet_path(level, &mutation.extent);
    let mut projected = None;
    let write = ConditionalWriter::new(store.client(), &path, store.timeout())
        .apply(|node| {
            projected = None;
            let Some(node) = node else {
                return WriteDecision::Reject("tablet does not exist".to_string());
            };
            let current = match decode_tablet(&path, node) {
                Ok(tablet) => tablet,
                Err(e) => return WriteDecision::Reject(e.to_string()),
            };
            for condition in &mutation.conditions {
                if let Err(reason) = condition.check(&current) {
                    return WriteDecision::Reject(reason);
                }
            }
            let mut updated = current.clone();
            for delta in &mutation.deltas {
                delta.apply(&mut updated);
            }
            let decision = match updated == current {
                true => WriteDecision::Unchanged,
                false => WriteDecision::Put(encode_tablet(&updated)),
            };
            projected = Some(updated);
            decision
        })
        .await;

    let extent = mutation.extent;
    let write = match write {
        Ok(write) => write,
        Err(e) => {
            warn!(extent = %extent, error = %e, "tablet mutation could not be evaluated");
            let reason = Some(e.to_string());
            let read_failure = match e {
                ConditionalWriteError::Unavailable { source, .. } => Some(source),
                ConditionalWriteError::RetriesExhausted { .. } => None,
            };
            let result = ConditionalResult {
                extent,
                outcome: MutationOutcome::Unknown,
                predicate_held: None,
                reason,
            };
            return (result, read_failure);
        }
    };

    let predicate_held = match (write.outcome, &mutation.predicate, &projected) {
        (MutationOutcome::Accepted, Some(predicate), Some(tablet)) => Some(predicate(tablet)),
        _ => None,
    };
    if predicate_held == Some(false) {
        warn!(extent = %extent, "tablet mutation accepted but acceptance check failed");
    }
    let reason = write.rejection.or_else(|| write.failure.map(|e| e.to_string()));
    debug!(extent = %extent, outcome = ?write.outcome, reason = ?reason, "tablet mutation processed");
    let result = ConditionalResult {
        extent,
        outcome: write.outcome,
        predicate_held,
        reason,
    };
    (result, None)
}
