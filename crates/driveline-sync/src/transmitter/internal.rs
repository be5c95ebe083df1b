//! In-process delivery via a registered callback.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::strand::{ListenerRevision, StrandUpdate, UpdateStatus};
use crate::transmitter::Transmitter;

/// The callback side of an internal listener.
///
/// Receivers are registered on the server under the name carried in the
/// listener's call info; delivery happens inside the server process.
#[async_trait]
pub trait StrandReceiver: Send + Sync {
    /// Consume one strand. An error leaves the whole strand unconsumed; it
    /// is re-delivered on the next trigger.
    async fn receive(&self, strand: &StrandUpdate) -> std::result::Result<(), String>;
}

/// Transmitter that hands strands to an in-process [`StrandReceiver`].
pub struct InternalTransmitter {
    receiver: Arc<dyn StrandReceiver>,
}

impl InternalTransmitter {
    pub fn new(receiver: Arc<dyn StrandReceiver>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl Transmitter for InternalTransmitter {
    async fn transmit(&self, strands: &[StrandUpdate]) -> Result<Vec<ListenerRevision>> {
        let mut acks = Vec::with_capacity(strands.len());
        for strand in strands {
            match self.receiver.receive(strand).await {
                Ok(()) => acks.push(strand.ack_all()),
                Err(reason) => {
                    debug!(
                        document = %strand.document_id,
                        scope = %strand.scope,
                        %reason,
                        "internal receiver rejected strand"
                    );
                    acks.push(strand.ack_none(UpdateStatus::Error));
                }
            }
        }
        Ok(acks)
    }
}

/// Receiver that forwards every strand into an unbounded channel. Used by
/// tests and by callers that want to consume updates as a stream.
pub struct ChannelReceiver {
    sender: tokio::sync::mpsc::UnboundedSender<StrandUpdate>,
}

impl ChannelReceiver {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<StrandUpdate>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl StrandReceiver for ChannelReceiver {
    async fn receive(&self, strand: &StrandUpdate) -> std::result::Result<(), String> {
        self.sender
            .send(strand.clone())
            .map_err(|_| "receiver channel closed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveline_core::{DocumentId, DriveId, Operation, Scope, MAIN_BRANCH};
    use serde_json::json;

    fn strand(indices: std::ops::Range<u64>) -> StrandUpdate {
        StrandUpdate {
            drive_id: DriveId::new("d1"),
            document_id: DocumentId::new("doc-1"),
            scope: Scope::Global,
            branch: MAIN_BRANCH.to_string(),
            operations: indices
                .map(|i| Operation::new(i, "SET", json!({"v": i}), Scope::Global, 1000))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_delivery_acks_full_consumption() {
        let (receiver, mut inbox) = ChannelReceiver::new();
        let transmitter = InternalTransmitter::new(Arc::new(receiver));

        let acks = transmitter.transmit(&[strand(0..3)]).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].revision, 2);
        assert_eq!(acks[0].status, UpdateStatus::Success);

        let delivered = inbox.recv().await.unwrap();
        assert_eq!(delivered.operations.len(), 3);
    }

    #[tokio::test]
    async fn test_receiver_failure_rewinds() {
        struct Rejecting;

        #[async_trait]
        impl StrandReceiver for Rejecting {
            async fn receive(&self, _: &StrandUpdate) -> std::result::Result<(), String> {
                Err("nope".to_string())
            }
        }

        let transmitter = InternalTransmitter::new(Arc::new(Rejecting));
        let acks = transmitter.transmit(&[strand(4..6)]).await.unwrap();
        assert_eq!(acks[0].revision, 3);
        assert_eq!(acks[0].status, UpdateStatus::Error);
    }
}
