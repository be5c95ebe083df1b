//! # Driveline Core
//!
//! Core primitives for the driveline synchronization engine.
//!
//! ## Overview
//!
//! Documents are append-only operation logs, one per scope. The append
//! engine decides whether an incoming batch is applicable (success,
//! conflict, or gap), applies accepted operations through an externally
//! supplied reducer, and collects the cross-document signals the reducer
//! requests. Drives are documents whose state is a listing of child
//! documents plus persisted listener declarations.
//!
//! ## Key Properties
//!
//! - **Contiguous logs**: per (scope, branch), accepted indices form a
//!   strictly increasing sequence starting at 0.
//! - **Producer-assigned indices**: the engine never renumbers accepted
//!   operations.
//! - **Collapsing undo**: consecutive no-op operations merge into a single
//!   log entry whose skip counts sum, so repeated undo does not grow the log.
//! - **Pure core**: the engine is synchronous and side-effect-free; signals
//!   are returned for the caller to dispatch.

pub mod append;
pub mod document;
pub mod drive;
pub mod error;
pub mod listener;
pub mod operation;
pub mod reducer;
pub mod types;

pub use append::{apply_operations, AppendOutcome, AppendStatus};
pub use document::{Document, DocumentHeader};
pub use drive::{
    drive_listeners, drive_state, new_drive, DriveLocalState, DriveReducer, DriveState, Node,
    DRIVE_DOCUMENT_TYPE,
};
pub use error::{CoreError, Result};
pub use listener::{
    CallInfo, Listener, ListenerFilter, TransmitterType, FILTER_WILDCARD,
};
pub use operation::{is_sorted_by_index, Operation, NOOP_KIND};
pub use reducer::{
    FnReducer, Reducer, ReducerError, ReducerRegistry, Signal, SignalOutcome,
};
pub use types::{
    canonical_bytes, now_millis, DocumentId, DriveId, ListenerId, Scope, StateHash, MAIN_BRANCH,
};
