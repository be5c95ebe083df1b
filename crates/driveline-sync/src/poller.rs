//! Pull client: the active side of pull synchronization.
//!
//! A poller drains a remote pull responder on an interval, applies each
//! incoming strand to a local sink, and reports consumption back so the
//! remote's cursor advances.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use driveline_core::{DriveId, ListenerId};

use crate::error::Result;
use crate::registry::ListenerRegistry;
use crate::strand::{ListenerRevision, StrandUpdate, UpdateStatus, WireStrandUpdate};

/// The remote side of a pull relationship: a pull-responder listener on
/// another server, reachable over some transport.
#[async_trait]
pub trait PullRemote: Send + Sync {
    /// Fetch the undelivered strands for this poller's listener.
    async fn fetch_strands(&self) -> Result<Vec<WireStrandUpdate>>;

    /// Report how far each strand was consumed.
    async fn acknowledge(&self, acks: &[ListenerRevision]) -> Result<()>;
}

/// Where pulled strands land: typically the local server's write path.
#[async_trait]
pub trait StrandSink: Send + Sync {
    /// Apply one incoming strand and report the outcome. Never fails; a
    /// local error becomes an ERROR or MISSING acknowledgment.
    async fn apply_strand(&self, strand: StrandUpdate) -> ListenerRevision;
}

/// Run one fetch/apply/acknowledge round. Returns the number of strands
/// fetched.
pub async fn poll_once(remote: &dyn PullRemote, sink: &dyn StrandSink) -> Result<usize> {
    let wire = remote.fetch_strands().await?;
    let fetched = wire.len();

    let mut acks = Vec::with_capacity(fetched);
    for update in &wire {
        match StrandUpdate::try_from(update) {
            Ok(strand) => acks.push(sink.apply_strand(strand).await),
            Err(e) => {
                // Undecodable payload: rewind so the remote retries it.
                warn!(document = %update.document_id, error = %e, "dropping undecodable strand");
                acks.push(ListenerRevision {
                    drive_id: update.drive_id.clone(),
                    document_id: update.document_id.clone(),
                    scope: update.scope,
                    branch: update.branch.clone(),
                    revision: update
                        .operations
                        .first()
                        .map(|op| op.index as i64 - 1)
                        .unwrap_or(-1),
                    status: UpdateStatus::Error,
                });
            }
        }
    }

    if !acks.is_empty() {
        remote.acknowledge(&acks).await?;
    }
    Ok(fetched)
}

/// Poller timing.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between rounds (ms).
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for the in-flight round to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn a poller against one remote. Failed rounds are logged and retried
/// on the next tick.
pub fn start_poller(
    remote: Arc<dyn PullRemote>,
    sink: Arc<dyn StrandSink>,
    config: PollerConfig,
) -> PollerHandle {
    let (shutdown, mut signal) = watch::channel(false);
    let interval = Duration::from_millis(config.interval_ms);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match poll_once(remote.as_ref(), sink.as_ref()).await {
                        Ok(fetched) if fetched > 0 => {
                            debug!(fetched, "poll round applied strands");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "poll round failed"),
                    }
                }
                _ = signal.changed() => {
                    if *signal.borrow() {
                        break;
                    }
                }
            }
        }
    });

    PollerHandle { shutdown, task }
}

/// A [`PullRemote`] served directly by an in-process registry. Used when
/// both ends live in the same process, and by replication tests.
pub struct RegistryPullRemote {
    registry: Arc<ListenerRegistry>,
    drive_id: DriveId,
    listener_id: ListenerId,
}

impl RegistryPullRemote {
    pub fn new(registry: Arc<ListenerRegistry>, drive_id: DriveId, listener_id: ListenerId) -> Self {
        Self {
            registry,
            drive_id,
            listener_id,
        }
    }
}

#[async_trait]
impl PullRemote for RegistryPullRemote {
    async fn fetch_strands(&self) -> Result<Vec<WireStrandUpdate>> {
        let strands = self
            .registry
            .get_strands(&self.drive_id, &self.listener_id)
            .await?;
        Ok(strands.iter().map(WireStrandUpdate::from).collect())
    }

    async fn acknowledge(&self, acks: &[ListenerRevision]) -> Result<()> {
        self.registry
            .process_acknowledge(&self.drive_id, &self.listener_id, acks)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveline_core::{DocumentId, Operation, Scope, MAIN_BRANCH};
    use serde_json::json;
    use tokio::sync::Mutex;

    struct FixedRemote {
        strands: Mutex<Vec<WireStrandUpdate>>,
        acks: Mutex<Vec<ListenerRevision>>,
    }

    #[async_trait]
    impl PullRemote for FixedRemote {
        async fn fetch_strands(&self) -> Result<Vec<WireStrandUpdate>> {
            Ok(self.strands.lock().await.drain(..).collect())
        }

        async fn acknowledge(&self, acks: &[ListenerRevision]) -> Result<()> {
            self.acks.lock().await.extend_from_slice(acks);
            Ok(())
        }
    }

    struct CollectingSink {
        applied: Mutex<Vec<StrandUpdate>>,
    }

    #[async_trait]
    impl StrandSink for CollectingSink {
        async fn apply_strand(&self, strand: StrandUpdate) -> ListenerRevision {
            let ack = strand.ack_all();
            self.applied.lock().await.push(strand);
            ack
        }
    }

    fn wire_strand(indices: std::ops::Range<u64>) -> WireStrandUpdate {
        let strand = StrandUpdate {
            drive_id: DriveId::new("d1"),
            document_id: DocumentId::new("doc-1"),
            scope: Scope::Global,
            branch: MAIN_BRANCH.to_string(),
            operations: indices
                .map(|i| Operation::new(i, "SET", json!({"v": i}), Scope::Global, 1000))
                .collect(),
        };
        WireStrandUpdate::from(&strand)
    }

    #[tokio::test]
    async fn test_poll_once_applies_and_acknowledges() {
        let remote = FixedRemote {
            strands: Mutex::new(vec![wire_strand(0..3)]),
            acks: Mutex::new(Vec::new()),
        };
        let sink = CollectingSink {
            applied: Mutex::new(Vec::new()),
        };

        let fetched = poll_once(&remote, &sink).await.unwrap();
        assert_eq!(fetched, 1);
        assert_eq!(sink.applied.lock().await.len(), 1);

        let acks = remote.acks.lock().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].revision, 2);
        assert_eq!(acks[0].status, UpdateStatus::Success);
    }

    #[tokio::test]
    async fn test_undecodable_strand_rewinds() {
        let mut wire = wire_strand(4..6);
        wire.operations[0].input = "{broken".to_string();
        let remote = FixedRemote {
            strands: Mutex::new(vec![wire]),
            acks: Mutex::new(Vec::new()),
        };
        let sink = CollectingSink {
            applied: Mutex::new(Vec::new()),
        };

        poll_once(&remote, &sink).await.unwrap();
        assert!(sink.applied.lock().await.is_empty());

        let acks = remote.acks.lock().await;
        assert_eq!(acks[0].revision, 3);
        assert_eq!(acks[0].status, UpdateStatus::Error);
    }

    #[tokio::test]
    async fn test_empty_round_skips_acknowledge() {
        let remote = FixedRemote {
            strands: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
        };
        let sink = CollectingSink {
            applied: Mutex::new(Vec::new()),
        };

        let fetched = poll_once(&remote, &sink).await.unwrap();
        assert_eq!(fetched, 0);
        assert!(remote.acks.lock().await.is_empty());
    }
}
