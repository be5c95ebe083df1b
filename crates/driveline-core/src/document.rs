//! Document: a header plus one append-only operation log per scope.
//!
//! Derived state is kept alongside the logs; it can always be recomputed by
//! replaying the logs over `initial_state` through the document's reducer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::operation::Operation;
use crate::types::{DocumentId, Scope};

/// Immutable-ish metadata of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHeader {
    /// The document's identifier within its drive.
    pub id: DocumentId,

    /// The document type, selecting the reducer that interprets operations.
    pub document_type: String,

    /// Creation time (Unix ms).
    pub created_at: i64,

    /// Last accepted write (Unix ms).
    pub last_modified_at: i64,
}

/// A document: header, per-scope state snapshots and per-scope logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Header metadata.
    pub header: DocumentHeader,

    /// Replay base per scope.
    pub initial_state: BTreeMap<Scope, serde_json::Value>,

    /// Current derived state per scope.
    pub state: BTreeMap<Scope, serde_json::Value>,

    /// The operation logs, one per scope.
    pub operations: BTreeMap<Scope, Vec<Operation>>,
}

impl Document {
    /// Create an empty document of the given type.
    ///
    /// Both scopes start from the given initial state value.
    pub fn new(
        id: DocumentId,
        document_type: impl Into<String>,
        initial_state: serde_json::Value,
        now: i64,
    ) -> Self {
        let mut initial = BTreeMap::new();
        let mut state = BTreeMap::new();
        let mut operations = BTreeMap::new();
        for scope in Scope::ALL {
            initial.insert(scope, initial_state.clone());
            state.insert(scope, initial_state.clone());
            operations.insert(scope, Vec::new());
        }
        Self {
            header: DocumentHeader {
                id,
                document_type: document_type.into(),
                created_at: now,
                last_modified_at: now,
            },
            initial_state: initial,
            state,
            operations,
        }
    }

    /// The index of the last accepted operation in a scope, or -1 if empty.
    pub fn revision(&self, scope: Scope) -> i64 {
        self.operations
            .get(&scope)
            .and_then(|ops| ops.last())
            .map(|op| op.index as i64)
            .unwrap_or(-1)
    }

    /// Revisions for all scopes.
    pub fn revisions(&self) -> BTreeMap<Scope, i64> {
        Scope::ALL
            .iter()
            .map(|&scope| (scope, self.revision(scope)))
            .collect()
    }

    /// The operation log for a scope (empty slice if none).
    pub fn operations(&self, scope: Scope) -> &[Operation] {
        self.operations
            .get(&scope)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Operations in a scope with `index > after`, in log order.
    ///
    /// `after = -1` returns the full log.
    pub fn operations_since(&self, scope: Scope, after: i64) -> Vec<Operation> {
        self.operations(scope)
            .iter()
            .filter(|op| op.index as i64 > after)
            .cloned()
            .collect()
    }

    /// Current derived state for a scope.
    pub fn state(&self, scope: Scope) -> &serde_json::Value {
        self.state
            .get(&scope)
            .unwrap_or(&serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_document_revisions() {
        let doc = Document::new("d1".into(), "test/model", json!({}), 1000);
        assert_eq!(doc.revision(Scope::Global), -1);
        assert_eq!(doc.revision(Scope::Local), -1);
    }

    #[test]
    fn test_operations_since() {
        let mut doc = Document::new("d1".into(), "test/model", json!({}), 1000);
        let ops = doc.operations.get_mut(&Scope::Global).unwrap();
        for i in 0..4 {
            ops.push(Operation::new(i, "SET", json!(i), Scope::Global, 1000));
        }

        assert_eq!(doc.revision(Scope::Global), 3);
        assert_eq!(doc.operations_since(Scope::Global, -1).len(), 4);
        let tail = doc.operations_since(Scope::Global, 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
    }
}
