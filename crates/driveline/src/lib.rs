//! # Driveline
//!
//! A synchronization server for documents modeled as append-only operation
//! logs.
//!
//! Every document carries one log per scope; an externally supplied reducer
//! per document type derives state from the log. Drives are documents whose
//! state is a listing of child documents plus persisted listener
//! declarations. Listeners consume log updates as strands through
//! transmitters: in-process callbacks, remote push endpoints, or passive
//! pull responders drained by a remote poller.
//!
//! [`DriveServer`] ties the layers together; the building blocks live in
//! `driveline-core`, `driveline-store` and `driveline-sync` and are
//! re-exported here.

pub mod error;
pub mod server;

pub use error::{Result, ServerError};
pub use server::{AppendResult, DriveServer, ServerConfig};

pub use driveline_core::{
    apply_operations, drive, drive_listeners, drive_state, new_drive, AppendOutcome, AppendStatus,
    CallInfo, CoreError, Document, DocumentHeader, DocumentId, DriveId, DriveReducer, DriveState,
    FnReducer, Listener, ListenerFilter, ListenerId, Node, Operation, Reducer, ReducerError,
    ReducerRegistry, Scope, Signal, SignalOutcome, StateHash, TransmitterType,
    DRIVE_DOCUMENT_TYPE, MAIN_BRANCH, NOOP_KIND,
};
pub use driveline_store::{DocumentStore, MemoryStore, SqliteStore, StoreError};
pub use driveline_sync::{
    poll_once, start_poller, start_trigger_loop, ChannelReceiver, ListenerRegistry,
    ListenerRevision, ListenerState, NoPushClients, PollerConfig, PollerHandle, PullRemote, PushClient,
    PushClientFactory, RegistryConfig, RegistryPullRemote, StrandReceiver, StrandSink,
    StrandUpdate, SyncError, SyncUnitId, SyncUnitIndex, SynchronizationUnit, TransmitterBinding,
    TriggerConfig, TriggerHandle, UnitQuery, UpdateStatus, WireOperation, WireStrandUpdate,
};
