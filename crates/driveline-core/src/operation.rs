//! Operation: one entry in a document's append-only log.
//!
//! Operations are indexed per (scope, branch); indices are assigned by the
//! producer and never renumbered after acceptance.

use serde::{Deserialize, Serialize};

use crate::types::{Scope, StateHash, MAIN_BRANCH};

/// The reserved operation type for undo/no-op entries.
///
/// A no-op with `skip = k` logically retracts the `k` operations that
/// precede it without removing them from the log.
pub const NOOP_KIND: &str = "NOOP";

/// One entry in a document's operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the (scope, branch) log. Assigned by the producer.
    pub index: u64,

    /// How many preceding operations this entry logically retracts.
    /// Only meaningful for no-op operations; 0 otherwise.
    pub skip: u64,

    /// The operation type, interpreted by the document's reducer.
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque payload handed to the reducer.
    pub input: serde_json::Value,

    /// Digest of the document state resulting from this operation.
    pub hash: StateHash,

    /// Producer-claimed timestamp (Unix ms).
    pub timestamp: i64,

    /// The scope whose log this operation belongs to.
    pub scope: Scope,

    /// The branch of the log. Currently always "main".
    pub branch: String,
}

impl Operation {
    /// Build an operation on the main branch.
    pub fn new(
        index: u64,
        kind: impl Into<String>,
        input: serde_json::Value,
        scope: Scope,
        timestamp: i64,
    ) -> Self {
        Self {
            index,
            skip: 0,
            kind: kind.into(),
            input,
            hash: StateHash::ZERO,
            timestamp,
            scope,
            branch: MAIN_BRANCH.to_string(),
        }
    }

    /// Build a no-op operation retracting `skip` predecessors.
    pub fn noop(index: u64, skip: u64, scope: Scope, timestamp: i64) -> Self {
        Self {
            index,
            skip,
            kind: NOOP_KIND.to_string(),
            input: serde_json::Value::Null,
            hash: StateHash::ZERO,
            timestamp,
            scope,
            branch: MAIN_BRANCH.to_string(),
        }
    }

    /// Whether this is a no-op/undo entry.
    pub fn is_noop(&self) -> bool {
        self.kind == NOOP_KIND
    }
}

/// Check that a same-scope slice of a batch is sorted by ascending index.
///
/// The append engine rejects out-of-order batches as malformed input rather
/// than treating them as log-level conflicts.
pub fn is_sorted_by_index(operations: &[&Operation]) -> bool {
    operations.windows(2).all(|w| w[0].index <= w[1].index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_noop_constructor() {
        let op = Operation::noop(3, 2, Scope::Global, 1000);
        assert!(op.is_noop());
        assert_eq!(op.skip, 2);
        assert_eq!(op.branch, MAIN_BRANCH);
    }

    #[test]
    fn test_sorted_check() {
        let a = Operation::new(0, "SET", json!(1), Scope::Global, 0);
        let b = Operation::new(1, "SET", json!(2), Scope::Global, 0);
        assert!(is_sorted_by_index(&[&a, &b]));
        assert!(!is_sorted_by_index(&[&b, &a]));
    }

    #[test]
    fn test_operation_serde_type_field() {
        let op = Operation::new(0, "SET", json!({"v": 1}), Scope::Global, 42);
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded["type"], "SET");
        assert_eq!(encoded["scope"], "global");

        let decoded: Operation = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, op);
    }
}
