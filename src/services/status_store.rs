//! Current-status store
//!
//! Single source of truth for the latest observed status of every spot.
//! Camera workers write through `transition`, which compares and writes under
//! one lock so two writers can never both observe the same change. Readers
//! (assignment, analytics, resync) see whole values only.

use crate::domain::types::{SpotId, SpotStatus};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stored value already equal to the observation; nothing written
    Unchanged,
    /// Value written; `previous` is `None` for a spot never seen before
    Changed { previous: Option<SpotStatus> },
}

impl Transition {
    pub fn is_change(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: RwLock<FxHashMap<SpotId, SpotStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status for a spot, `None` if never written
    pub fn get(&self, spot_id: SpotId) -> Option<SpotStatus> {
        self.statuses.read().get(&spot_id).copied()
    }

    /// Latest status, falling back to a persisted default
    pub fn status_or(&self, spot_id: SpotId, fallback: SpotStatus) -> SpotStatus {
        self.get(spot_id).unwrap_or(fallback)
    }

    /// Unconditional write, returns the previous value
    pub fn set(&self, spot_id: SpotId, status: SpotStatus) -> Option<SpotStatus> {
        self.statuses.write().insert(spot_id, status)
    }

    /// Write `status` only if it differs from the stored value.
    ///
    /// Comparison and write happen under the same write lock.
    pub fn transition(&self, spot_id: SpotId, status: SpotStatus) -> Transition {
        // Fast path: most frames repeat the stored status
        if self.statuses.read().get(&spot_id) == Some(&status) {
            return Transition::Unchanged;
        }

        let mut statuses = self.statuses.write();
        match statuses.insert(spot_id, status) {
            Some(previous) if previous == status => Transition::Unchanged,
            previous => Transition::Changed { previous },
        }
    }

    /// Camera write path: like `transition`, except an observed `Free` leaves a
    /// `Reserved` spot untouched. Only an `Occupied` observation or an explicit
    /// release ends a reservation.
    pub fn observe(&self, spot_id: SpotId, status: SpotStatus) -> Transition {
        if status != SpotStatus::Free {
            return self.transition(spot_id, status);
        }

        let mut statuses = self.statuses.write();
        match statuses.get(&spot_id).copied() {
            Some(SpotStatus::Free) | Some(SpotStatus::Reserved) => Transition::Unchanged,
            previous => {
                statuses.insert(spot_id, status);
                Transition::Changed { previous }
            }
        }
    }

    /// Replace `expected` with `new` atomically.
    ///
    /// A spot with no stored value is compared as `fallback`. Returns true if
    /// the write happened.
    pub fn compare_and_swap(
        &self,
        spot_id: SpotId,
        expected: SpotStatus,
        new: SpotStatus,
        fallback: SpotStatus,
    ) -> bool {
        let mut statuses = self.statuses.write();
        let current = statuses.get(&spot_id).copied().unwrap_or(fallback);
        if current != expected {
            return false;
        }
        statuses.insert(spot_id, new);
        true
    }

    /// Copy of every stored status
    pub fn snapshot(&self) -> FxHashMap<SpotId, SpotStatus> {
        self.statuses.read().clone()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }
}
