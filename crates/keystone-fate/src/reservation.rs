//! Reservation cache and forced-takeover policy.

use std::collections::HashMap;

use keystone_kv_types::NodeData;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::types::FateId;
use crate::types::FateReservation;

/// When a reservation may be forcibly taken from an owner that stopped responding.
///
/// Reservation stamps come from the owner's clock, so an age comparison is
/// only meaningful once the threshold is padded with the worst clock skew
/// expected between workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReservationTakeoverPolicy {
    /// Never take over; stale reservations are cleared through liveness checks only.
    #[default]
    Disabled,
    /// Take over once the reservation is older than `threshold_ms + clock_skew_allowance_ms`.
    AfterAge {
        threshold_ms: u64,
        clock_skew_allowance_ms: u64,
    },
}

impl ReservationTakeoverPolicy {
    /// Minimum reservation age before takeover, or `None` if takeover is disabled.
    pub fn min_age_ms(&self) -> Option<u64> {
        match self {
            ReservationTakeoverPolicy::Disabled => None,
            ReservationTakeoverPolicy::AfterAge {
                threshold_ms,
                clock_skew_allowance_ms,
            } => Some(threshold_ms.saturating_add(*clock_skew_allowance_ms)),
        }
    }

    /// Check whether `reservation` is old enough to take over at `now_ms`.
    pub fn check(&self, reservation: &FateReservation, now_ms: u64) -> Result<(), String> {
        let Some(min_age_ms) = self.min_age_ms() else {
            return Err("takeover disabled by policy".to_string());
        };
        let age_ms = reservation.age_ms(now_ms);
        if age_ms < min_age_ms {
            return Err(format!("reservation by {} is {age_ms}ms old, policy requires {min_age_ms}ms", reservation.owner));
        }
        Ok(())
    }
}

/// Recently observed transaction nodes, used as the first-attempt snapshot
/// for reservation writes.
///
/// Entries may be stale; a stale entry costs one failed version check.
pub(crate) struct ReservationCache {
    entries: Mutex<HashMap<FateId, NodeData>>,
    capacity: usize,
}

impl ReservationCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub(crate) fn get(&self, fate_id: &FateId) -> Option<NodeData> {
        self.entries.lock().get(fate_id).cloned()
    }

    pub(crate) fn record(&self, fate_id: FateId, node: NodeData) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&fate_id) {
            let victim = entries.keys().next().copied();
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(fate_id, node);
    }

    pub(crate) fn invalidate(&self, fate_id: &FateId) {
        self.entries.lock().remove(fate_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
