//! Strand updates and acknowledgments: the transport-agnostic envelopes
//! exchanged between the registry and transmitters.

use serde::{Deserialize, Serialize};

use driveline_core::{DocumentId, DriveId, Operation, Scope, StateHash};

use crate::error::{Result, SyncError};

/// Delivery status of a listener cursor or acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateStatus {
    /// Cursor freshly seeded, nothing delivered yet.
    Created,
    /// Delivery in flight.
    Pending,
    /// Last delivery acknowledged in full.
    Success,
    /// Last delivery failed; the same range is retried next cycle.
    Error,
    /// The receiving side lacks the target stream.
    Missing,
}

/// One contiguous slice of a stream's log, bounded below by the requesting
/// listener's `listener_revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandUpdate {
    pub drive_id: DriveId,
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: String,
    pub operations: Vec<Operation>,
}

impl StrandUpdate {
    /// Index of the last operation carried, if any.
    pub fn last_index(&self) -> Option<u64> {
        self.operations.last().map(|op| op.index)
    }

    /// The revision to acknowledge when nothing was consumed: the index
    /// immediately preceding the first operation.
    pub fn rewind_revision(&self) -> i64 {
        self.operations
            .first()
            .map(|op| op.index as i64 - 1)
            .unwrap_or(-1)
    }

    /// An acknowledgment for this strand.
    pub fn ack(&self, revision: i64, status: UpdateStatus) -> ListenerRevision {
        ListenerRevision {
            drive_id: self.drive_id.clone(),
            document_id: self.document_id.clone(),
            scope: self.scope,
            branch: self.branch.clone(),
            revision,
            status,
        }
    }

    /// A full-consumption acknowledgment.
    pub fn ack_all(&self) -> ListenerRevision {
        let revision = self
            .last_index()
            .map(|i| i as i64)
            .unwrap_or_else(|| self.rewind_revision());
        self.ack(revision, UpdateStatus::Success)
    }

    /// A nothing-consumed acknowledgment with the given status.
    pub fn ack_none(&self, status: UpdateStatus) -> ListenerRevision {
        self.ack(self.rewind_revision(), status)
    }
}

/// A transmitter's report of how far a stream was actually consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerRevision {
    pub drive_id: DriveId,
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: String,
    /// Index of the last consumed operation.
    pub revision: i64,
    pub status: UpdateStatus,
}

// ─────────────────────────────────────────────────────────────────────────
// Wire forms
// ─────────────────────────────────────────────────────────────────────────

/// Operation as carried across the network boundary: `input` is
/// string-encoded rather than embedded structurally, everything else as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    pub index: u64,
    pub skip: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub input: String,
    pub hash: StateHash,
    pub timestamp: i64,
    pub scope: Scope,
    pub branch: String,
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        Self {
            index: op.index,
            skip: op.skip,
            kind: op.kind.clone(),
            input: op.input.to_string(),
            hash: op.hash,
            timestamp: op.timestamp,
            scope: op.scope,
            branch: op.branch.clone(),
        }
    }
}

impl TryFrom<&WireOperation> for Operation {
    type Error = SyncError;

    fn try_from(wire: &WireOperation) -> Result<Self> {
        let input = serde_json::from_str(&wire.input)
            .map_err(|e| SyncError::Serialization(format!("operation input: {e}")))?;
        Ok(Operation {
            index: wire.index,
            skip: wire.skip,
            kind: wire.kind.clone(),
            input,
            hash: wire.hash,
            timestamp: wire.timestamp,
            scope: wire.scope,
            branch: wire.branch.clone(),
        })
    }
}

/// Strand update in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireStrandUpdate {
    pub drive_id: DriveId,
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: String,
    pub operations: Vec<WireOperation>,
}

impl From<&StrandUpdate> for WireStrandUpdate {
    fn from(strand: &StrandUpdate) -> Self {
        Self {
            drive_id: strand.drive_id.clone(),
            document_id: strand.document_id.clone(),
            scope: strand.scope,
            branch: strand.branch.clone(),
            operations: strand.operations.iter().map(WireOperation::from).collect(),
        }
    }
}

impl TryFrom<&WireStrandUpdate> for StrandUpdate {
    type Error = SyncError;

    fn try_from(wire: &WireStrandUpdate) -> Result<Self> {
        let operations = wire
            .operations
            .iter()
            .map(Operation::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            drive_id: wire.drive_id.clone(),
            document_id: wire.document_id.clone(),
            scope: wire.scope,
            branch: wire.branch.clone(),
            operations,
        })
    }
}
