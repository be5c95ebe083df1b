//! Proptest strategies over driveline values.

use proptest::prelude::*;
use serde_json::json;

use driveline_core::{Operation, Scope};

/// Either scope, equally likely.
pub fn scope() -> impl Strategy<Value = Scope> {
    prop_oneof![Just(Scope::Global), Just(Scope::Local)]
}

/// A contiguous run of counter ADD operations starting at `start`.
pub fn contiguous_adds(
    start: u64,
    max_len: usize,
    scope: Scope,
) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(-10i64..10, 1..=max_len).prop_map(move |deltas| {
        deltas
            .into_iter()
            .enumerate()
            .map(|(i, delta)| {
                Operation::new(start + i as u64, "ADD", json!({ "delta": delta }), scope, 0)
            })
            .collect()
    })
}

/// A batch that is contiguous except for one dropped operation, producing a
/// gap the append engine must reject.
pub fn batch_with_gap(max_len: usize) -> impl Strategy<Value = Vec<Operation>> {
    (2..=max_len)
        .prop_flat_map(|len| (Just(len), 1..len))
        .prop_map(|(len, hole)| {
            (0..len)
                .filter(|i| *i != hole)
                .map(|i| {
                    Operation::new(i as u64, "ADD", json!({ "delta": 1 }), Scope::Global, 0)
                })
                .collect()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_contiguous_adds_are_contiguous(batch in contiguous_adds(3, 8, Scope::Global)) {
            for (i, op) in batch.iter().enumerate() {
                prop_assert_eq!(op.index, 3 + i as u64);
            }
        }

        #[test]
        fn prop_gap_batches_have_a_hole(batch in batch_with_gap(8)) {
            let contiguous = batch.windows(2).all(|w| w[1].index == w[0].index + 1);
            prop_assert!(!contiguous);
        }
    }
}
