//! # Driveline Testkit
//!
//! Shared fixtures and proptest generators for the driveline crates.

pub mod fixtures;
pub mod generators;

pub use fixtures::{counter_registry, init_tracing, seeded_store, CounterReducer, TEST_COUNTER_TYPE};
