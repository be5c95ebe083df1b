//! Push delivery to a remote endpoint.
//!
//! The transport itself lives behind [`PushClient`]; the transmitter only
//! converts strands to wire form and turns transport failures into
//! rewinding acknowledgments so the same range is retried next cycle.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use driveline_core::CallInfo;

use crate::error::{Result, SyncError};
use crate::strand::{ListenerRevision, StrandUpdate, UpdateStatus, WireStrandUpdate};
use crate::transmitter::Transmitter;

/// A client capable of delivering wire-form strand updates to one remote
/// endpoint and returning the remote's acknowledgments.
#[async_trait]
pub trait PushClient: Send + Sync {
    async fn push(&self, updates: &[WireStrandUpdate]) -> Result<Vec<ListenerRevision>>;
}

/// Builds push clients from a listener's call info at registration and
/// startup-rebuild time.
#[async_trait]
pub trait PushClientFactory: Send + Sync {
    async fn client(&self, call_info: &CallInfo) -> Result<Arc<dyn PushClient>>;
}

/// Factory for deployments without push listeners; any attempt to bind one
/// is a configuration error.
pub struct NoPushClients;

#[async_trait]
impl PushClientFactory for NoPushClients {
    async fn client(&self, call_info: &CallInfo) -> Result<Arc<dyn PushClient>> {
        Err(SyncError::Configuration(format!(
            "no push client available for '{}'",
            call_info.name
        )))
    }
}

/// Transmitter that forwards strands through a [`PushClient`].
pub struct PushTransmitter {
    client: Arc<dyn PushClient>,
}

impl PushTransmitter {
    pub fn new(client: Arc<dyn PushClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transmitter for PushTransmitter {
    async fn transmit(&self, strands: &[StrandUpdate]) -> Result<Vec<ListenerRevision>> {
        let wire: Vec<WireStrandUpdate> = strands.iter().map(WireStrandUpdate::from).collect();
        match self.client.push(&wire).await {
            Ok(acks) => Ok(acks),
            Err(e) => {
                warn!(error = %e, "push delivery failed");
                Ok(strands
                    .iter()
                    .map(|s| s.ack_none(UpdateStatus::Error))
                    .collect())
            }
        }
    }
}

/// In-memory push transport for tests and same-process wiring.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Push client that forwards updates into an unbounded channel and
    /// acknowledges full consumption.
    pub struct MemoryPushClient {
        sender: mpsc::UnboundedSender<WireStrandUpdate>,
    }

    /// A connected (client, inbox) pair.
    pub fn channel() -> (
        MemoryPushClient,
        mpsc::UnboundedReceiver<WireStrandUpdate>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (MemoryPushClient { sender }, receiver)
    }

    #[async_trait]
    impl PushClient for MemoryPushClient {
        async fn push(&self, updates: &[WireStrandUpdate]) -> Result<Vec<ListenerRevision>> {
            let mut acks = Vec::with_capacity(updates.len());
            for update in updates {
                let strand = StrandUpdate::try_from(update)?;
                self.sender
                    .send(update.clone())
                    .map_err(|_| SyncError::Transport("push channel closed".to_string()))?;
                acks.push(strand.ack_all());
            }
            Ok(acks)
        }
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
    async fn test_memory_push_roundtrip() {
        let (client, mut inbox) = memory::channel();
        let transmitter = PushTransmitter::new(Arc::new(client));

        let acks = transmitter.transmit(&[strand(0..2)]).await.unwrap();
        assert_eq!(acks[0].revision, 1);
        assert_eq!(acks[0].status, UpdateStatus::Success);

        let wire = inbox.recv().await.unwrap();
        assert_eq!(wire.operations.len(), 2);
        assert_eq!(wire.operations[0].input, r#"{"v":0}"#);
    }

    #[tokio::test]
    async fn test_transport_failure_rewinds_every_strand() {
        struct Broken;

        #[async_trait]
        impl PushClient for Broken {
            async fn push(&self, _: &[WireStrandUpdate]) -> Result<Vec<ListenerRevision>> {
                Err(SyncError::Transport("unreachable".to_string()))
            }
        }

        let transmitter = PushTransmitter::new(Arc::new(Broken));
        let acks = transmitter.transmit(&[strand(3..5)]).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].revision, 2);
        assert_eq!(acks[0].status, UpdateStatus::Error);
    }
}
