//! The trigger loop: periodic delivery of listener backlogs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use driveline_core::now_millis;

use crate::registry::ListenerRegistry;

/// Trigger loop timing.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Delay between delivery cycles (ms).
    pub interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Handle to a running trigger loop.
pub struct TriggerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Stop the loop and wait for the in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the delivery loop. Each cycle runs one `trigger_update` pass over
/// all drives; cycles never overlap.
pub fn start_trigger_loop(registry: Arc<ListenerRegistry>, config: TriggerConfig) -> TriggerHandle {
    let (shutdown, mut signal) = watch::channel(false);
    let interval = Duration::from_millis(config.interval_ms);
    info!(interval_ms = config.interval_ms, "trigger loop started");

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.clone().trigger_update(None, now_millis()).await;
                }
                _ = signal.changed() => {
                    if *signal.borrow() {
                        debug!("trigger loop stopping");
                        break;
                    }
                }
            }
        }
    });

    TriggerHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::transmitter::internal::ChannelReceiver;
    use crate::transmitter::TransmitterBinding;
    use crate::unit::{SyncUnitId, SynchronizationUnit};
    use driveline_core::{
        apply_operations, drive, new_drive, CallInfo, Document, DocumentId, DriveId, DriveReducer,
        Listener, ListenerFilter, ListenerId, Operation, Reducer, ReducerError, Scope, Signal,
        MAIN_BRANCH,
    };
    use driveline_store::{DocumentStore, MemoryStore};
    use serde_json::{json, Value};

    struct Counter;

    impl Reducer for Counter {
        fn apply(
            &self,
            state: &Value,
            operation: &Operation,
        ) -> std::result::Result<(Value, Vec<Signal>), ReducerError> {
            let current = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            let delta = operation
                .input
                .get("delta")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok((json!({ "count": current + delta }), Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_loop_delivers_and_stops() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let drive_id = DriveId::new("d1");
        let mut drive_doc = new_drive(&drive_id, "Test", 1000);
        let add = drive::ops::add_file(0, &"doc-1".into(), "Doc", "test/counter", None, 1000);
        apply_operations(&mut drive_doc, &DriveReducer, &[add]).unwrap();
        store.create_drive(&drive_id, drive_doc).await.unwrap();
        let doc_id = DocumentId::new("doc-1");
        store
            .create_document(
                &drive_id,
                &doc_id,
                Document::new("doc-1".into(), "test/counter", json!({"count": 0}), 1000),
            )
            .await
            .unwrap();

        let registry = Arc::new(ListenerRegistry::new(
            store.clone(),
            RegistryConfig::default(),
        ));
        let (receiver, mut inbox) = ChannelReceiver::new();
        registry
            .add_listener(
                Listener {
                    id: ListenerId::new("l1"),
                    drive_id: drive_id.clone(),
                    label: "l1".to_string(),
                    system: false,
                    block: false,
                    filter: ListenerFilter::all().with_document_types(["test/counter"]),
                    call_info: CallInfo::internal("cb"),
                },
                TransmitterBinding::Internal(Arc::new(receiver)),
            )
            .await
            .unwrap();

        let handle = start_trigger_loop(registry.clone(), TriggerConfig { interval_ms: 10 });

        let mut document = store.get_document(&drive_id, &doc_id).await.unwrap();
        let batch = [Operation::new(0, "ADD", json!({"delta": 1}), Scope::Global, 2000)];
        let outcome = apply_operations(&mut document, &Counter, &batch).unwrap();
        store
            .add_document_operations(&drive_id, &doc_id, &outcome.operations, &document)
            .await
            .unwrap();
        registry
            .update_sync_revision(&SynchronizationUnit {
                sync_id: SyncUnitId::derive(&doc_id, Scope::Global),
                drive_id: drive_id.clone(),
                document_id: doc_id.clone(),
                scope: Scope::Global,
                branch: MAIN_BRANCH.to_string(),
                document_type: "test/counter".to_string(),
                revision: document.revision(Scope::Global),
                last_updated: 2000,
            })
            .await;

        let delivered = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("loop should deliver within the timeout")
            .unwrap();
        assert_eq!(delivered.operations.len(), 1);
        assert_eq!(delivered.operations[0].index, 0);

        handle.stop().await;
    }
}
