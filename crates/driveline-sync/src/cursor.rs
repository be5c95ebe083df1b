//! Per-listener, per-unit delivery cursors.

use serde::{Deserialize, Serialize};

use crate::strand::UpdateStatus;
use crate::unit::SynchronizationUnit;

/// Delivery progress of one listener against one synchronization unit.
///
/// `listener_revision` is the index of the last operation the listener
/// confirmed consuming (-1 before anything was delivered); `sync_revision`
/// mirrors the unit's revision as of the last time the unit was observed.
/// New work exists exactly when `sync_revision > listener_revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerState {
    pub unit: SynchronizationUnit,
    pub listener_revision: i64,
    pub sync_revision: i64,
    pub status: UpdateStatus,
    /// When a PENDING delivery stops blocking re-triggering (Unix ms).
    pub pending_expiry: Option<i64>,
}

impl ListenerState {
    /// Seed a fresh cursor for a newly-tracked unit.
    pub fn seed(unit: SynchronizationUnit) -> Self {
        let sync_revision = unit.revision;
        Self {
            unit,
            listener_revision: -1,
            sync_revision,
            status: UpdateStatus::Created,
            pending_expiry: None,
        }
    }

    /// Whether undelivered operations exist for this cursor.
    pub fn has_backlog(&self) -> bool {
        self.sync_revision > self.listener_revision
    }

    /// Whether an in-flight delivery still blocks a new one at `now`.
    pub fn is_pending(&self, now: i64) -> bool {
        self.status == UpdateStatus::Pending
            && self.pending_expiry.map(|expiry| now < expiry).unwrap_or(true)
    }

    /// Mark a delivery as started.
    pub fn mark_pending(&mut self, expiry: Option<i64>) {
        self.status = UpdateStatus::Pending;
        self.pending_expiry = expiry;
    }

    /// Apply an acknowledgment. The listener revision only moves forward;
    /// stale or rewound acknowledgments update the status but never the
    /// cursor position.
    pub fn acknowledge(&mut self, revision: i64, status: UpdateStatus) {
        if revision > self.listener_revision {
            self.listener_revision = revision;
        }
        self.status = status;
        self.pending_expiry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SyncUnitId;
    use driveline_core::{DocumentId, DriveId, Scope, MAIN_BRANCH};

    fn unit(revision: i64) -> SynchronizationUnit {
        let document_id = DocumentId::new("doc-1");
        SynchronizationUnit {
            sync_id: SyncUnitId::derive(&document_id, Scope::Global),
            drive_id: DriveId::new("d1"),
            document_id,
            scope: Scope::Global,
            branch: MAIN_BRANCH.to_string(),
            document_type: "test/counter".to_string(),
            revision,
            last_updated: 1000,
        }
    }

    #[test]
    fn test_seed_has_backlog_when_unit_nonempty() {
        let empty = ListenerState::seed(unit(-1));
        assert!(!empty.has_backlog());

        let seeded = ListenerState::seed(unit(2));
        assert_eq!(seeded.listener_revision, -1);
        assert_eq!(seeded.sync_revision, 2);
        assert!(seeded.has_backlog());
    }

    #[test]
    fn test_acknowledge_is_monotonic() {
        let mut state = ListenerState::seed(unit(5));
        state.acknowledge(3, UpdateStatus::Success);
        assert_eq!(state.listener_revision, 3);

        state.acknowledge(1, UpdateStatus::Error);
        assert_eq!(state.listener_revision, 3);
        assert_eq!(state.status, UpdateStatus::Error);
    }

    proptest::proptest! {
        /// No sequence of acknowledgments ever moves the cursor backwards.
        #[test]
        fn prop_cursor_never_rewinds(revisions in proptest::collection::vec(-1i64..50, 1..20)) {
            let mut state = ListenerState::seed(unit(50));
            let mut high = -1i64;
            for revision in revisions {
                state.acknowledge(revision, UpdateStatus::Success);
                high = high.max(revision);
                proptest::prop_assert_eq!(state.listener_revision, high);
            }
        }
    }

    #[test]
    fn test_pending_expiry() {
        let mut state = ListenerState::seed(unit(5));
        state.mark_pending(Some(2000));
        assert!(state.is_pending(1500));
        assert!(!state.is_pending(2000));

        state.mark_pending(None);
        assert!(state.is_pending(i64::MAX));
    }
}
