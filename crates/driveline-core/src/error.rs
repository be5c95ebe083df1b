//! Error types for the core crate.

use thiserror::Error;

use crate::types::Scope;

/// Errors produced by core document and append-engine code.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A batch was malformed before any log comparison happened.
    #[error("validation error: {0}")]
    Validation(String),

    /// No reducer is registered for a document type.
    #[error("unknown document type: {0}")]
    UnknownDocumentType(String),

    /// Scope string did not parse.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// The external state-transition function failed.
    #[error("reducer error: {0}")]
    Reducer(String),

    /// An operation targets an index that is already occupied.
    #[error("conflict in scope {scope}: operation index {index} <= current revision {revision}")]
    Conflict {
        scope: Scope,
        index: u64,
        revision: i64,
    },

    /// An operation targets an index beyond the next expected one.
    #[error("missing operations in scope {scope}: operation index {index}, expected {expected}")]
    MissingOperations {
        scope: Scope,
        index: u64,
        expected: u64,
    },

    /// Serialization of a state or input payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
