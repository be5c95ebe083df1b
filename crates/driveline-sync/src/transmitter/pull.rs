//! Pull responder: the passive delivery surface.
//!
//! Nothing is pushed anywhere; the remote side drains its backlog through
//! `get_strands` and reports consumption through `process_acknowledge`.
//! The trigger loop skips pull listeners entirely, so this transmitter only
//! exists to keep the binding set closed.

use async_trait::async_trait;

use crate::error::Result;
use crate::strand::{ListenerRevision, StrandUpdate};
use crate::transmitter::Transmitter;

pub struct PullResponderTransmitter;

#[async_trait]
impl Transmitter for PullResponderTransmitter {
    async fn transmit(&self, _strands: &[StrandUpdate]) -> Result<Vec<ListenerRevision>> {
        Ok(Vec::new())
    }
}
