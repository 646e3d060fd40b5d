//! Optimistic conditional writes against a single coordination node.
//!
//! Both the transaction reservation protocol and the tablet metadata mutator
//! reduce to the same shape: read a node, decide from its current contents
//! whether the precondition holds and what to write, then write only if the
//! node version is unchanged. [`ConditionalWriter`] owns that loop so the
//! two subsystems cannot drift apart.
//!
//! A lost version race re-reads and re-decides; the precondition is therefore
//! always evaluated against the state the write actually replaces. A write
//! whose acknowledgement is lost (connection drop, session expiry, timeout)
//! is reported as [`MutationOutcome::Unknown`] because it may or may not have
//! been applied.

use std::time::Duration;

use keystone_constants::CAS_RETRY_INITIAL_BACKOFF_MS;
use keystone_constants::CAS_RETRY_MAX_BACKOFF_MS;
use keystone_constants::MAX_CAS_RETRIES;
use keystone_kv_types::CoordinationClientError;
use keystone_kv_types::CreateMode;
use keystone_kv_types::NodeData;
use keystone_kv_types::NodeStat;
use keystone_traits::CoordinationClient;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::trace;

use crate::error::ConditionalWriteError;
use crate::time::bounded;

/// Per-record result of a conditional mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOutcome {
    /// The precondition held and the write was acknowledged.
    Accepted,
    /// The precondition did not hold; nothing was written.
    Rejected,
    /// The write was sent but its acknowledgement was lost.
    Unknown,
}

impl MutationOutcome {
    /// True only for [`MutationOutcome::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, MutationOutcome::Accepted)
    }
}

/// What to do with the node, decided from its current contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    /// Write these bytes, creating the node if it is absent.
    Put(Vec<u8>),
    /// Remove the node.
    Delete,
    /// The precondition failed.
    Reject(String),
    /// The node is already in the desired state.
    Unchanged,
}

/// Result of a completed conditional write.
#[derive(Debug, Clone)]
pub struct ConditionalWrite {
    pub outcome: MutationOutcome,
    /// Node contents the final decision was made against (`None` if absent).
    pub observed: Option<NodeData>,
    /// Node version after an accepted `Put`.
    pub new_stat: Option<NodeStat>,
    /// Why the write was rejected, if it was.
    pub rejection: Option<String>,
    /// Whether anything was sent to the service on the final attempt.
    pub wrote: bool,
    /// Client error behind an [`MutationOutcome::Unknown`] outcome.
    pub failure: Option<CoordinationClientError>,
}

enum Attempt {
    Done(ConditionalWrite),
    Conflict,
}

/// Read, decide and version-CAS loop over one node.
pub struct ConditionalWriter<'a, C: CoordinationClient + ?Sized> {
    client: &'a C,
    path: &'a str,
    timeout: Duration,
    snapshot: Option<NodeData>,
}

impl<'a, C: CoordinationClient + ?Sized> ConditionalWriter<'a, C> {
    /// Create a writer for `path` with a per-round-trip `timeout`.
    pub fn new(client: &'a C, path: &'a str, timeout: Duration) -> Self {
        Self {
            client,
            path,
            timeout,
            snapshot: None,
        }
    }

    /// Use a previously observed node state for the first attempt instead of reading.
    ///
    /// A stale snapshot costs one failed CAS and a re-read. A rejection or a
    /// no-op decided against the snapshot is re-checked against a fresh read
    /// before it is returned.
    pub fn with_snapshot(mut self, snapshot: Option<NodeData>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Run the loop until the decision is applied, rejected or becomes ambiguous.
    pub async fn apply<F>(self, mut decide: F) -> Result<ConditionalWrite, ConditionalWriteError>
    where F: FnMut(Option<&NodeData>) -> WriteDecision {
        let mut snapshot = self.snapshot.clone();
        let mut backoff_ms = CAS_RETRY_INITIAL_BACKOFF_MS;

        for attempt in 1..=MAX_CAS_RETRIES {
            let (observed, cached) = match snapshot.take() {
                Some(cached) => (Some(cached), true),
                None => (self.read_current().await?, false),
            };

            let decision = decide(observed.as_ref());
            // Only a version check or a fresh read may settle the outcome.
            if cached && matches!(decision, WriteDecision::Reject(_) | WriteDecision::Unchanged) {
                trace!(path = %self.path, attempt, "snapshot decision needs a fresh read");
                continue;
            }
            match self.attempt(observed, decision).await {
                Attempt::Done(done) => return Ok(done),
                Attempt::Conflict => {
                    debug!(path = %self.path, attempt, backoff_ms, "conditional write lost version race, retrying");
                    let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                    backoff_ms = (backoff_ms * 2).min(CAS_RETRY_MAX_BACKOFF_MS);
                }
            }
        }

        Err(ConditionalWriteError::RetriesExhausted {
            path: self.path.to_string(),
            attempts: MAX_CAS_RETRIES,
        })
    }

    async fn read_current(&self) -> Result<Option<NodeData>, ConditionalWriteError> {
        match bounded(self.timeout, self.client.read(self.path)).await {
            Ok(node) => Ok(Some(node)),
            Err(CoordinationClientError::NoNode { .. }) => Ok(None),
            Err(source) => Err(ConditionalWriteError::Unavailable {
                path: self.path.to_string(),
                source,
            }),
        }
    }

    async fn attempt(&self, observed: Option<NodeData>, decision: WriteDecision) -> Attempt {
        match decision {
            WriteDecision::Reject(reason) => {
                trace!(path = %self.path, %reason, "conditional write rejected");
                Attempt::Done(done(MutationOutcome::Rejected, observed, None, Some(reason), false))
            }
            WriteDecision::Unchanged => Attempt::Done(done(MutationOutcome::Accepted, observed, None, None, false)),
            WriteDecision::Put(data) => self.put(observed, data).await,
            WriteDecision::Delete => self.delete(observed).await,
        }
    }

    async fn put(&self, observed: Option<NodeData>, data: Vec<u8>) -> Attempt {
        let result = match &observed {
            Some(node) => bounded(self.timeout, self.client.set(self.path, data, Some(node.stat.version))).await,
            None => bounded(self.timeout, self.client.create(self.path, data, CreateMode::Persistent)).await,
        };

        match result {
            Ok(stat) => Attempt::Done(done(MutationOutcome::Accepted, observed, Some(stat), None, true)),
            Err(CoordinationClientError::BadVersion { .. }) | Err(CoordinationClientError::NodeExists { .. }) => {
                Attempt::Conflict
            }
            // Deleted underneath a versioned set: re-decide against absence.
            Err(CoordinationClientError::NoNode { .. }) if observed.is_some() => Attempt::Conflict,
            Err(CoordinationClientError::NoNode { path }) => Attempt::Done(done(
                MutationOutcome::Rejected,
                observed,
                None,
                Some(format!("parent of '{path}' does not exist")),
                true,
            )),
            Err(e) if e.is_unavailable() => {
                debug!(path = %self.path, error = %e, "conditional put outcome unknown");
                Attempt::Done(unknown(observed, e))
            }
            Err(e) => Attempt::Done(done(MutationOutcome::Rejected, observed, None, Some(e.to_string()), true)),
        }
    }

    async fn delete(&self, observed: Option<NodeData>) -> Attempt {
        let Some(version) = observed.as_ref().map(|node| node.stat.version) else {
            // Already absent.
            return Attempt::Done(done(MutationOutcome::Accepted, observed, None, None, false));
        };

        match bounded(self.timeout, self.client.delete(self.path, Some(version))).await {
            Ok(()) => Attempt::Done(done(MutationOutcome::Accepted, observed, None, None, true)),
            Err(CoordinationClientError::BadVersion { .. }) | Err(CoordinationClientError::NoNode { .. }) => {
                Attempt::Conflict
            }
            Err(e) if e.is_unavailable() => {
                debug!(path = %self.path, error = %e, "conditional delete outcome unknown");
                Attempt::Done(unknown(observed, e))
            }
            Err(e) => Attempt::Done(done(MutationOutcome::Rejected, observed, None, Some(e.to_string()), true)),
        }
    }
}

fn done(
    outcome: MutationOutcome,
    observed: Option<NodeData>,
    new_stat: Option<NodeStat>,
    rejection: Option<String>,
    wrote: bool,
) -> ConditionalWrite {
    ConditionalWrite {
        outcome,
        observed,
        new_stat,
        rejection,
        wrote,
        failure: None,
    }
}

fn unknown(observed: Option<NodeData>, failure: CoordinationClientError) -> ConditionalWrite {
    ConditionalWrite {
        outcome: MutationOutcome::Unknown,
        observed,
        new_stat: None,
        rejection: None,
        wrote: true,
        failure: Some(failure),
    }
}
