//! Common fixtures: the counter document model and tracing setup.

use std::sync::{Arc, Once};

use serde_json::{json, Value};

use driveline_core::{
    apply_operations, drive, new_drive, Document, DocumentId, DriveId, DriveReducer, Operation,
    Reducer, ReducerError, ReducerRegistry, Scope, Signal,
};
use driveline_store::{DocumentStore, MemoryStore};

/// Document type of the counter model used across the test suites.
pub const TEST_COUNTER_TYPE: &str = "test/counter";

/// A minimal reducer: state is `{"count": n}`, operations are
/// `ADD {delta}` and `SET {value}`.
pub struct CounterReducer;

impl Reducer for CounterReducer {
    fn apply(
        &self,
        state: &Value,
        operation: &Operation,
    ) -> Result<(Value, Vec<Signal>), ReducerError> {
        let current = state.get("count").and_then(Value::as_i64).unwrap_or(0);
        let next = match operation.kind.as_str() {
            "ADD" => {
                let delta = operation
                    .input
                    .get("delta")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ReducerError::new("ADD requires a numeric delta"))?;
                current + delta
            }
            "SET" => operation
                .input
                .get("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| ReducerError::new("SET requires a numeric value"))?,
            other => return Err(ReducerError::new(format!("unknown counter operation: {other}"))),
        };
        Ok((json!({ "count": next }), Vec::new()))
    }
}

impl CounterReducer {
    /// An ADD operation at the given index.
    pub fn add(index: u64, delta: i64, scope: Scope, now: i64) -> Operation {
        Operation::new(index, "ADD", json!({ "delta": delta }), scope, now)
    }

    /// A SET operation at the given index.
    pub fn set(index: u64, value: i64, scope: Scope, now: i64) -> Operation {
        Operation::new(index, "SET", json!({ "value": value }), scope, now)
    }
}

/// A reducer registry with the counter model installed.
pub fn counter_registry() -> ReducerRegistry {
    let mut registry = ReducerRegistry::new();
    registry.register(TEST_COUNTER_TYPE, std::sync::Arc::new(CounterReducer));
    registry
}

/// A memory store seeded with one drive holding one counter file.
///
/// Returns the store plus the ids of the drive and the file document.
pub async fn seeded_store() -> (Arc<dyn DocumentStore>, DriveId, DocumentId) {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let drive_id = DriveId::new("d1");
    let doc_id = DocumentId::new("doc-1");

    let mut drive_doc = new_drive(&drive_id, "Test Drive", 1000);
    let add = drive::ops::add_file(0, &doc_id, "Doc 1", TEST_COUNTER_TYPE, None, 1000);
    apply_operations(&mut drive_doc, &DriveReducer, &[add]).expect("seed drive listing");
    store
        .create_drive(&drive_id, drive_doc)
        .await
        .expect("seed drive");
    store
        .create_document(
            &drive_id,
            &doc_id,
            Document::new(doc_id.clone(), TEST_COUNTER_TYPE, json!({"count": 0}), 1000),
        )
        .await
        .expect("seed document");

    (store, drive_id, doc_id)
}

/// Install a compact tracing subscriber once per test binary. Honors
/// `RUST_LOG`; silent by default.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .compact()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_reducer_add_and_set() {
        let mut document = Document::new("c1".into(), TEST_COUNTER_TYPE, json!({"count": 0}), 0);
        let batch = [
            CounterReducer::add(0, 5, Scope::Global, 0),
            CounterReducer::add(1, -2, Scope::Global, 0),
            CounterReducer::set(2, 10, Scope::Global, 0),
        ];
        apply_operations(&mut document, &CounterReducer, &batch).unwrap();
        assert_eq!(document.state(Scope::Global), &json!({"count": 10}));
    }

    #[test]
    fn test_counter_reducer_rejects_bad_input() {
        let document = json!({"count": 0});
        let op = Operation::new(0, "ADD", json!({}), Scope::Global, 0);
        assert!(CounterReducer.apply(&document, &op).is_err());
    }
}
