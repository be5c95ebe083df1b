//! # Driveline Sync
//!
//! Listener-based synchronization on top of the driveline stores.
//!
//! Every (drive, document, scope, branch) log is a synchronization unit.
//! Listeners select units with filters and consume them as strands, each
//! strand a contiguous slice of one unit's log starting just past the
//! listener's cursor. Delivery runs through transmitters: in-process
//! callbacks, remote push endpoints, or passive pull responders drained by
//! a [`poller`] on the other side.

pub mod cursor;
pub mod error;
pub mod poller;
pub mod registry;
pub mod strand;
pub mod transmitter;
pub mod trigger;
pub mod unit;

pub use cursor::ListenerState;
pub use error::{Result, SyncError};
pub use poller::{
    poll_once, start_poller, PollerConfig, PollerHandle, PullRemote, RegistryPullRemote,
    StrandSink,
};
pub use registry::{ListenerRegistry, RegistryConfig};
pub use strand::{
    ListenerRevision, StrandUpdate, UpdateStatus, WireOperation, WireStrandUpdate,
};
pub use transmitter::{
    ChannelReceiver, InternalTransmitter, NoPushClients, PullResponderTransmitter, PushClient,
    PushClientFactory, PushTransmitter, StrandReceiver, Transmitter, TransmitterBinding,
};
pub use trigger::{start_trigger_loop, TriggerConfig, TriggerHandle};
pub use unit::{SyncUnitId, SyncUnitIndex, SynchronizationUnit, UnitQuery};
