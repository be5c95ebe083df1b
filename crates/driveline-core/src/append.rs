//! The operation append engine.
//!
//! Validates an incoming batch against a document's per-scope logs and
//! applies the accepted prefix through the document's reducer. Pure and
//! synchronous: signals requested by the reducer are collected into the
//! outcome, never dispatched here.

use crate::document::Document;
use crate::error::{CoreError, Result};
use crate::operation::{is_sorted_by_index, Operation};
use crate::reducer::{Reducer, Signal};
use crate::types::{Scope, StateHash};

/// Outcome taxonomy for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// All operations were accepted.
    Success,
    /// An operation targeted an index at or below the current revision.
    Conflict,
    /// An operation targeted an index beyond the next expected one.
    Missing,
    /// The reducer failed while applying an operation.
    Error,
}

/// Result of applying a batch.
///
/// In every non-success case `operations` holds the prefix of the batch that
/// was accepted before the abort, and those operations stay applied.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Per-batch outcome.
    pub status: AppendStatus,
    /// The accepted operations, in acceptance order, with hashes filled in.
    pub operations: Vec<Operation>,
    /// Signals drained from the reducer for the accepted operations.
    pub signals: Vec<Signal>,
    /// The underlying cause for non-success outcomes.
    pub error: Option<String>,
}

impl AppendOutcome {
    fn success(operations: Vec<Operation>, signals: Vec<Signal>) -> Self {
        Self {
            status: AppendStatus::Success,
            operations,
            signals,
            error: None,
        }
    }

    fn aborted(
        status: AppendStatus,
        operations: Vec<Operation>,
        signals: Vec<Signal>,
        cause: &CoreError,
    ) -> Self {
        Self {
            status,
            operations,
            signals,
            error: Some(cause.to_string()),
        }
    }
}

/// Apply a batch of operations to a document.
///
/// The batch may span scopes; within each scope operations must already be
/// sorted by ascending index, otherwise the whole batch is rejected with a
/// [`CoreError::Validation`] before anything is applied.
///
/// Per candidate operation against the scope's last accepted index `L`:
/// - `index == L + 1`: accept, apply the reducer, append to the log.
/// - `index <= L`: abort with [`AppendStatus::Conflict`].
/// - `index > L + 1`: abort with [`AppendStatus::Missing`].
///
/// A no-op candidate arriving while the log's last entry is itself a no-op
/// collapses into it: the existing entry is replaced in place, same index,
/// with the two skip counts summed. The log does not grow.
pub fn apply_operations(
    document: &mut Document,
    reducer: &dyn Reducer,
    batch: &[Operation],
) -> Result<AppendOutcome> {
    validate_batch(batch)?;

    let mut accepted = Vec::new();
    let mut signals = Vec::new();

    for candidate in batch {
        match apply_one(document, reducer, candidate) {
            Ok((applied, mut op_signals)) => {
                signals.append(&mut op_signals);
                accepted.push(applied);
            }
            Err(cause) => {
                let status = match &cause {
                    CoreError::Conflict { .. } => AppendStatus::Conflict,
                    CoreError::MissingOperations { .. } => AppendStatus::Missing,
                    _ => AppendStatus::Error,
                };
                return Ok(AppendOutcome::aborted(status, accepted, signals, &cause));
            }
        }
    }

    Ok(AppendOutcome::success(accepted, signals))
}

/// Reject malformed batches before touching the document.
fn validate_batch(batch: &[Operation]) -> Result<()> {
    for scope in Scope::ALL {
        let slice: Vec<&Operation> = batch.iter().filter(|op| op.scope == scope).collect();
        if !is_sorted_by_index(&slice) {
            return Err(CoreError::Validation(format!(
                "batch not sorted by index in scope {scope}"
            )));
        }
    }
    Ok(())
}

/// Apply a single candidate, returning the operation as recorded in the log.
fn apply_one(
    document: &mut Document,
    reducer: &dyn Reducer,
    candidate: &Operation,
) -> Result<(Operation, Vec<Signal>)> {
    let scope = candidate.scope;
    let revision = document.revision(scope);

    let last_is_noop = document
        .operations(scope)
        .last()
        .map(|op| op.is_noop())
        .unwrap_or(false);

    // Undo collapsing: a no-op following a no-op merges into it in place.
    // The candidate may reuse the collapsed entry's index or target the
    // next slot; either way the log does not grow.
    if candidate.is_noop() && last_is_noop {
        let index = candidate.index as i64;
        if index == revision || index == revision + 1 {
            return collapse_noop(document, reducer, candidate);
        }
    }

    let index = candidate.index as i64;
    if index <= revision {
        return Err(CoreError::Conflict {
            scope,
            index: candidate.index,
            revision,
        });
    }
    if index > revision + 1 {
        return Err(CoreError::MissingOperations {
            scope,
            index: candidate.index,
            expected: (revision + 1) as u64,
        });
    }

    let mut applied = candidate.clone();

    if candidate.is_noop() {
        // A no-op changes derived state only through skip resolution; the
        // reducer never sees it.
        document
            .operations
            .entry(scope)
            .or_default()
            .push(applied.clone());
        let state = replay_scope(document, reducer, scope)?;
        applied.hash = StateHash::digest(&state);
        if let Some(entry) = document.operations.get_mut(&scope).and_then(|l| l.last_mut()) {
            entry.hash = applied.hash;
        }
        document.state.insert(scope, state);
        return Ok((applied, Vec::new()));
    }

    let current = document.state(scope).clone();
    let (next_state, signals) = reducer.apply(&current, candidate)?;

    if applied.hash == StateHash::ZERO {
        applied.hash = StateHash::digest(&next_state);
    }

    document
        .operations
        .entry(scope)
        .or_default()
        .push(applied.clone());
    document.state.insert(scope, next_state);

    Ok((applied, signals))
}

/// Merge a no-op candidate into the log's trailing no-op entry.
fn collapse_noop(
    document: &mut Document,
    reducer: &dyn Reducer,
    candidate: &Operation,
) -> Result<(Operation, Vec<Signal>)> {
    let scope = candidate.scope;

    {
        let log = document.operations.entry(scope).or_default();
        let last = log.last_mut().expect("collapse requires a trailing no-op");
        last.skip += candidate.skip;
        last.timestamp = candidate.timestamp;
    }

    let state = replay_scope(document, reducer, scope)?;
    let hash = StateHash::digest(&state);
    let merged = {
        let log = document.operations.entry(scope).or_default();
        let last = log.last_mut().expect("collapse requires a trailing no-op");
        last.hash = hash;
        last.clone()
    };
    document.state.insert(scope, state);

    Ok((merged, Vec::new()))
}

/// Recompute a scope's derived state by replaying its full log with skip
/// semantics resolved.
fn replay_scope(
    document: &Document,
    reducer: &dyn Reducer,
    scope: Scope,
) -> Result<serde_json::Value> {
    let mut effective: Vec<&Operation> = Vec::new();
    for op in document.operations(scope) {
        if op.is_noop() {
            let keep = effective.len().saturating_sub(op.skip as usize);
            effective.truncate(keep);
        } else {
            effective.push(op);
        }
    }

    let mut state = document
        .initial_state
        .get(&scope)
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    for op in effective {
        let (next, _signals) = reducer.apply(&state, op)?;
        state = next;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{FnReducer, ReducerError};
    use proptest::prelude::*;
    use serde_json::json;

    fn counter_reducer() -> impl Reducer {
        FnReducer(|state: &serde_json::Value, op: &Operation| {
            let count = state["count"].as_i64().unwrap_or(0);
            let next = match op.kind.as_str() {
                "INCREMENT" => count + 1,
                "DECREMENT" => count - 1,
                "SET" => op.input.as_i64().unwrap_or(0),
                "FAIL" => return Err(ReducerError::new("induced failure")),
                other => return Err(ReducerError::new(format!("unknown op {other}"))),
            };
            Ok((json!({ "count": next }), vec![]))
        })
    }

    fn doc() -> Document {
        Document::new("doc-1".into(), "test/counter", json!({"count": 0}), 1000)
    }

    fn incr(index: u64) -> Operation {
        Operation::new(index, "INCREMENT", json!(null), Scope::Global, 1000)
    }

    #[test]
    fn test_contiguous_batch_succeeds() {
        let mut document = doc();
        let reducer = counter_reducer();
        let batch = vec![incr(0), incr(1), incr(2)];

        let outcome = apply_operations(&mut document, &reducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);
        assert_eq!(outcome.operations.len(), 3);
        assert_eq!(document.revision(Scope::Global), 2);
        assert_eq!(document.state(Scope::Global), &json!({"count": 3}));
    }

    #[test]
    fn test_duplicate_index_conflicts() {
        let mut document = doc();
        let reducer = counter_reducer();
        apply_operations(&mut document, &reducer, &[incr(0)]).unwrap();

        let outcome = apply_operations(&mut document, &reducer, &[incr(0)]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Conflict);
        assert!(outcome.operations.is_empty());
        assert_eq!(document.revision(Scope::Global), 0);
    }

    #[test]
    fn test_gap_reports_missing() {
        let mut document = doc();
        let reducer = counter_reducer();
        apply_operations(&mut document, &reducer, &[incr(0)]).unwrap();

        let outcome = apply_operations(&mut document, &reducer, &[incr(2)]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Missing);
        assert!(outcome.operations.is_empty());
        assert_eq!(document.revision(Scope::Global), 0);
    }

    #[test]
    fn test_conflict_keeps_accepted_prefix() {
        let mut document = doc();
        let reducer = counter_reducer();
        apply_operations(&mut document, &reducer, &[incr(0)]).unwrap();

        // 1 and 2 extend the log; the second 2 collides.
        let batch = vec![incr(1), incr(2), incr(2)];
        let outcome = apply_operations(&mut document, &reducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Conflict);
        assert_eq!(outcome.operations.len(), 2);
        assert_eq!(document.revision(Scope::Global), 2);
    }

    #[test]
    fn test_unsorted_batch_is_validation_error() {
        let mut document = doc();
        let reducer = counter_reducer();

        let err = apply_operations(&mut document, &reducer, &[incr(1), incr(0)]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(document.revision(Scope::Global), -1);
    }

    #[test]
    fn test_reducer_failure_aborts_with_prefix() {
        let mut document = doc();
        let reducer = counter_reducer();

        let batch = vec![
            incr(0),
            Operation::new(1, "FAIL", json!(null), Scope::Global, 1000),
            incr(2),
        ];
        let outcome = apply_operations(&mut document, &reducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Error);
        assert_eq!(outcome.operations.len(), 1);
        assert_eq!(document.revision(Scope::Global), 0);
        assert!(outcome.error.unwrap().contains("induced failure"));
    }

    #[test]
    fn test_noop_collapse_sums_skips() {
        let mut document = doc();
        let reducer = counter_reducer();
        apply_operations(&mut document, &reducer, &[incr(0), incr(1), incr(2)]).unwrap();

        let undo1 = Operation::noop(3, 1, Scope::Global, 1001);
        apply_operations(&mut document, &reducer, &[undo1]).unwrap();
        assert_eq!(document.operations(Scope::Global).len(), 4);
        assert_eq!(document.state(Scope::Global), &json!({"count": 2}));

        // Second undo at the same position collapses instead of appending.
        let undo2 = Operation::noop(3, 2, Scope::Global, 1002);
        let outcome = apply_operations(&mut document, &reducer, &[undo2]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);

        let log = document.operations(Scope::Global);
        assert_eq!(log.len(), 4);
        let last = log.last().unwrap();
        assert!(last.is_noop());
        assert_eq!(last.index, 3);
        assert_eq!(last.skip, 3);
        assert_eq!(document.state(Scope::Global), &json!({"count": 0}));
        assert_eq!(document.revision(Scope::Global), 3);
    }

    #[test]
    fn test_non_noop_after_noop_appends_normally() {
        let mut document = doc();
        let reducer = counter_reducer();
        apply_operations(&mut document, &reducer, &[incr(0), incr(1)]).unwrap();
        apply_operations(
            &mut document,
            &reducer,
            &[Operation::noop(2, 1, Scope::Global, 1001)],
        )
        .unwrap();

        let outcome = apply_operations(&mut document, &reducer, &[incr(3)]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);
        assert_eq!(document.operations(Scope::Global).len(), 4);
        // replay: ops 0..1 applied, op 1 retracted, op 3 applied
        assert_eq!(document.state(Scope::Global), &json!({"count": 2}));
    }

    #[test]
    fn test_scopes_are_independent() {
        let mut document = doc();
        let reducer = counter_reducer();
        let local = Operation::new(0, "INCREMENT", json!(null), Scope::Local, 1000);

        let outcome = apply_operations(&mut document, &reducer, &[incr(0), local]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);
        assert_eq!(document.revision(Scope::Global), 0);
        assert_eq!(document.revision(Scope::Local), 0);
    }

    proptest! {
        #[test]
        fn prop_revision_tracks_last_accepted(batch_len in 1usize..20) {
            let mut document = doc();
            let reducer = counter_reducer();
            let batch: Vec<Operation> = (0..batch_len as u64).map(incr).collect();

            let outcome = apply_operations(&mut document, &reducer, &batch).unwrap();
            prop_assert_eq!(outcome.status, AppendStatus::Success);
            prop_assert_eq!(document.revision(Scope::Global), batch_len as i64 - 1);
        }

        #[test]
        fn prop_conflict_prefix_length(total in 2usize..15, collide_at in 0usize..14) {
            prop_assume!(collide_at < total - 1);
            let mut document = doc();
            let reducer = counter_reducer();

            // Operations 0..total, but one in the middle reuses an index.
            let mut batch: Vec<Operation> = (0..total as u64).map(incr).collect();
            batch[collide_at + 1].index = collide_at as u64;
            // Keep the batch sorted so it passes validation.
            batch.truncate(collide_at + 2);

            let outcome = apply_operations(&mut document, &reducer, &batch).unwrap();
            prop_assert_eq!(outcome.status, AppendStatus::Conflict);
            prop_assert_eq!(outcome.operations.len(), collide_at + 1);
        }

        #[test]
        fn prop_indices_stay_contiguous(len in 1usize..25) {
            let mut document = doc();
            let reducer = counter_reducer();
            let batch: Vec<Operation> = (0..len as u64).map(incr).collect();
            apply_operations(&mut document, &reducer, &batch).unwrap();

            for (i, op) in document.operations(Scope::Global).iter().enumerate() {
                prop_assert_eq!(op.index as usize, i);
            }
        }
    }
}
