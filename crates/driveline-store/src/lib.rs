//! # Driveline Store
//!
//! Storage abstraction for driveline drives and documents.
//!
//! The [`DocumentStore`] trait is the single persistence contract the engine
//! consumes; [`MemoryStore`] and [`SqliteStore`] are interchangeable
//! implementations of it.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::DocumentStore;
