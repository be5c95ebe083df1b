//! Reducer: the externally supplied state-transition function per document
//! type, plus the signal side-channel it may use to request cross-document
//! actions.
//!
//! Signals are returned, not emitted through a callback, so the append engine
//! stays single-threaded and side-effect-free; the caller drains and
//! dispatches them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::document::Document;
use crate::error::{CoreError, Result};
use crate::operation::Operation;
use crate::types::DocumentId;

/// A cross-document action requested by a reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    /// Create a child document in the same drive.
    CreateChildDocument {
        id: DocumentId,
        document_type: String,
        /// Initial content; None means an empty document of the type.
        document: Option<Document>,
    },

    /// Delete a child document from the drive.
    DeleteChildDocument { id: DocumentId },

    /// Copy an existing child document's content into a new id.
    CopyChildDocument {
        source_id: DocumentId,
        target_id: DocumentId,
    },
}

/// The result of dispatching one signal against the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutcome {
    /// The signal that was dispatched.
    pub signal: Signal,
    /// Error message if dispatch failed. Signal failures do not unwind
    /// already-accepted operations in the batch.
    pub error: Option<String>,
}

/// Failure of the external state-transition function.
#[derive(Debug, Clone)]
pub struct ReducerError(pub String);

impl ReducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for ReducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ReducerError {}

impl From<ReducerError> for CoreError {
    fn from(err: ReducerError) -> Self {
        CoreError::Reducer(err.0)
    }
}

/// The per-document-type state-transition function.
///
/// Treated as a pure, deterministic black box: `(state, operation)` in, new
/// state and zero or more signals out. Skip semantics of no-op operations are
/// applied here, not in the append engine.
pub trait Reducer: Send + Sync {
    fn apply(
        &self,
        state: &serde_json::Value,
        operation: &Operation,
    ) -> std::result::Result<(serde_json::Value, Vec<Signal>), ReducerError>;
}

impl fmt::Debug for dyn Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reducer")
    }
}

/// A reducer built from a plain function, for tests and simple models.
pub struct FnReducer<F>(pub F);

impl<F> Reducer for FnReducer<F>
where
    F: Fn(
            &serde_json::Value,
            &Operation,
        ) -> std::result::Result<(serde_json::Value, Vec<Signal>), ReducerError>
        + Send
        + Sync,
{
    fn apply(
        &self,
        state: &serde_json::Value,
        operation: &Operation,
    ) -> std::result::Result<(serde_json::Value, Vec<Signal>), ReducerError> {
        (self.0)(state, operation)
    }
}

/// Registry of reducers keyed by document type.
#[derive(Default, Clone)]
pub struct ReducerRegistry {
    reducers: HashMap<String, Arc<dyn Reducer>>,
}

impl ReducerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer for a document type, replacing any existing one.
    pub fn register(&mut self, document_type: impl Into<String>, reducer: Arc<dyn Reducer>) {
        self.reducers.insert(document_type.into(), reducer);
    }

    /// Look up the reducer for a document type.
    ///
    /// An unknown type is a validation-level error, not a log outcome.
    pub fn get(&self, document_type: &str) -> Result<Arc<dyn Reducer>> {
        self.reducers
            .get(document_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDocumentType(document_type.to_string()))
    }

    /// Whether a document type is registered.
    pub fn contains(&self, document_type: &str) -> bool {
        self.reducers.contains_key(document_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;
    use serde_json::json;

    #[test]
    fn test_fn_reducer() {
        let reducer = FnReducer(|state: &serde_json::Value, _op: &Operation| {
            let count = state["count"].as_i64().unwrap_or(0);
            Ok((json!({ "count": count + 1 }), vec![]))
        });

        let op = Operation::new(0, "INCREMENT", json!(null), Scope::Global, 0);
        let (state, signals) = reducer.apply(&json!({"count": 2}), &op).unwrap();
        assert_eq!(state, json!({"count": 3}));
        assert!(signals.is_empty());
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = ReducerRegistry::new();
        let err = registry.get("nope/model").unwrap_err();
        assert!(matches!(err, CoreError::UnknownDocumentType(_)));
    }
}
