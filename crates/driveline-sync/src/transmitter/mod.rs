//! Transmitters: the delivery strategies a listener can be bound to.
//!
//! The set is closed. A binding carries everything its transmitter needs
//! (the in-process receiver, the push client), so dispatch is a plain match
//! instead of name-based lookup.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use driveline_core::{CallInfo, TransmitterType};

use crate::error::Result;
use crate::strand::{ListenerRevision, StrandUpdate};

pub mod internal;
pub mod pull;
pub mod push;

pub use internal::{ChannelReceiver, InternalTransmitter, StrandReceiver};
pub use pull::PullResponderTransmitter;
pub use push::{NoPushClients, PushClient, PushClientFactory, PushTransmitter};

/// Delivers strand updates to one listener and reports how far each stream
/// was consumed.
#[async_trait]
pub trait Transmitter: Send + Sync {
    async fn transmit(&self, strands: &[StrandUpdate]) -> Result<Vec<ListenerRevision>>;
}

/// The concrete delivery target a listener was registered with.
#[derive(Clone)]
pub enum TransmitterBinding {
    /// In-process callback.
    Internal(Arc<dyn StrandReceiver>),
    /// Remote push endpoint.
    Push(Arc<dyn PushClient>),
    /// Passive surface served through `get_strands`/`process_acknowledge`.
    PullResponder,
}

impl TransmitterBinding {
    pub fn transmitter_type(&self) -> TransmitterType {
        match self {
            TransmitterBinding::Internal(_) => TransmitterType::Internal,
            TransmitterBinding::Push(_) => TransmitterType::Push,
            TransmitterBinding::PullResponder => TransmitterType::PullResponder,
        }
    }

    /// Whether this binding satisfies a listener's declared call info.
    pub fn matches(&self, call_info: &CallInfo) -> bool {
        self.transmitter_type() == call_info.transmitter_type
    }

    /// Instantiate the transmitter for this binding.
    pub fn build(&self) -> Arc<dyn Transmitter> {
        match self {
            TransmitterBinding::Internal(receiver) => {
                Arc::new(InternalTransmitter::new(receiver.clone()))
            }
            TransmitterBinding::Push(client) => Arc::new(PushTransmitter::new(client.clone())),
            TransmitterBinding::PullResponder => Arc::new(PullResponderTransmitter),
        }
    }
}

impl fmt::Debug for TransmitterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transmitter_type().as_str())
    }
}
