//! Listener registry: cursors, strand assembly, and delivery.
//!
//! The registry owns one entry per (drive, listener) with a cursor per
//! matched synchronization unit. All cursor state is in-memory; it is
//! rebuilt on startup from the listener declarations persisted in each
//! drive's local state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use driveline_core::{DocumentId, DriveId, Listener, ListenerId, TransmitterType};
use driveline_store::{DocumentStore, StoreError};

use crate::cursor::ListenerState;
use crate::error::{Result, SyncError};
use crate::strand::{ListenerRevision, StrandUpdate, UpdateStatus};
use crate::transmitter::TransmitterBinding;
use crate::unit::{SyncUnitId, SyncUnitIndex, SynchronizationUnit};

/// Tuning knobs for delivery.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a PENDING delivery blocks re-triggering (ms).
    pub pending_timeout_ms: i64,

    /// Upper bound on operations carried per strand.
    pub max_operations_per_strand: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 300_000,
            max_operations_per_strand: 1000,
        }
    }
}

struct ListenerEntry {
    listener: Listener,
    binding: TransmitterBinding,
    cursors: HashMap<SyncUnitId, ListenerState>,
}

impl ListenerEntry {
    fn matches_unit(&self, unit: &SynchronizationUnit) -> bool {
        self.listener.filter.matches(
            &unit.document_id,
            &unit.document_type,
            unit.scope,
            &unit.branch,
        )
    }
}

/// Registry of active listeners and their delivery cursors.
pub struct ListenerRegistry {
    store: Arc<dyn DocumentStore>,
    index: SyncUnitIndex,
    config: RegistryConfig,
    entries: RwLock<HashMap<(DriveId, ListenerId), ListenerEntry>>,
}

impl ListenerRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Self {
        let index = SyncUnitIndex::new(store.clone());
        Self {
            store,
            index,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Listener lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Register a listener and seed a cursor per currently-matching unit.
    ///
    /// The binding must agree with the listener's declared call info.
    pub async fn add_listener(
        &self,
        listener: Listener,
        binding: TransmitterBinding,
    ) -> Result<()> {
        if !binding.matches(&listener.call_info) {
            return Err(SyncError::Configuration(format!(
                "listener '{}' declares {} but was bound to {}",
                listener.id,
                listener.call_info.transmitter_type,
                binding.transmitter_type()
            )));
        }

        let mut cursors = HashMap::new();
        for unit in self.index.drive_units(&listener.drive_id).await? {
            if listener.filter.matches(
                &unit.document_id,
                &unit.document_type,
                unit.scope,
                &unit.branch,
            ) {
                cursors.insert(unit.sync_id, ListenerState::seed(unit));
            }
        }

        debug!(
            drive = %listener.drive_id,
            listener = %listener.id,
            units = cursors.len(),
            "listener registered"
        );

        let key = (listener.drive_id.clone(), listener.id.clone());
        self.entries.write().await.insert(
            key,
            ListenerEntry {
                listener,
                binding,
                cursors,
            },
        );
        Ok(())
    }

    /// Remove a listener. Idempotent: returns whether anything was removed.
    pub async fn remove_listener(&self, drive_id: &DriveId, listener_id: &ListenerId) -> bool {
        self.entries
            .write()
            .await
            .remove(&(drive_id.clone(), listener_id.clone()))
            .is_some()
    }

    /// Drop every listener of a drive. Used when the drive is deleted.
    pub async fn remove_drive(&self, drive_id: &DriveId) {
        self.entries
            .write()
            .await
            .retain(|(drive, _), _| drive != drive_id);
    }

    /// Fetch one listener's declaration.
    pub async fn listener(&self, drive_id: &DriveId, listener_id: &ListenerId) -> Result<Listener> {
        self.entries
            .read()
            .await
            .get(&(drive_id.clone(), listener_id.clone()))
            .map(|entry| entry.listener.clone())
            .ok_or_else(|| SyncError::ListenerNotFound {
                drive_id: drive_id.clone(),
                listener_id: listener_id.clone(),
            })
    }

    /// All listeners registered on a drive.
    pub async fn listeners(&self, drive_id: &DriveId) -> Vec<Listener> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|((drive, _), _)| drive == drive_id)
            .map(|(_, entry)| entry.listener.clone())
            .collect()
    }

    /// A snapshot of one listener's cursors, for inspection.
    pub async fn listener_states(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
    ) -> Result<Vec<ListenerState>> {
        self.entries
            .read()
            .await
            .get(&(drive_id.clone(), listener_id.clone()))
            .map(|entry| entry.cursors.values().cloned().collect())
            .ok_or_else(|| SyncError::ListenerNotFound {
                drive_id: drive_id.clone(),
                listener_id: listener_id.clone(),
            })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Unit tracking
    // ─────────────────────────────────────────────────────────────────────

    /// Record a unit's new revision on every matching cursor, seeding
    /// cursors for units not seen before. Called on the write path after a
    /// successful append.
    pub async fn update_sync_revision(&self, unit: &SynchronizationUnit) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.listener.drive_id != unit.drive_id || !entry.matches_unit(unit) {
                continue;
            }
            match entry.cursors.get_mut(&unit.sync_id) {
                Some(state) => {
                    if unit.revision > state.sync_revision {
                        state.sync_revision = unit.revision;
                    }
                    state.unit = unit.clone();
                }
                None => {
                    entry
                        .cursors
                        .insert(unit.sync_id, ListenerState::seed(unit.clone()));
                }
            }
        }
    }

    /// Forget a unit everywhere. Called when its document is deleted.
    pub async fn remove_unit(&self, drive_id: &DriveId, sync_id: &SyncUnitId) {
        let mut entries = self.entries.write().await;
        for ((drive, _), entry) in entries.iter_mut() {
            if drive == drive_id {
                entry.cursors.remove(sync_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Strands and acknowledgments
    // ─────────────────────────────────────────────────────────────────────

    /// Assemble the undelivered operations for one listener, one strand per
    /// backlogged cursor.
    pub async fn get_strands(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
    ) -> Result<Vec<StrandUpdate>> {
        let cursors: Vec<ListenerState> = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(&(drive_id.clone(), listener_id.clone()))
                .ok_or_else(|| SyncError::ListenerNotFound {
                    drive_id: drive_id.clone(),
                    listener_id: listener_id.clone(),
                })?;
            entry
                .cursors
                .values()
                .filter(|state| state.has_backlog())
                .cloned()
                .collect()
        };

        let mut strands = Vec::new();
        for state in cursors {
            let unit = &state.unit;
            let document = match self.load_stream(drive_id, &unit.document_id).await {
                Ok(document) => document,
                Err(SyncError::Store(StoreError::NotFound(_))) => {
                    // Deleted under us; the cursor goes away with the unit.
                    warn!(drive = %drive_id, document = %unit.document_id, "backlogged unit vanished");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut operations = document.operations_since(unit.scope, state.listener_revision);
            operations.truncate(self.config.max_operations_per_strand);
            if operations.is_empty() {
                continue;
            }
            strands.push(StrandUpdate {
                drive_id: drive_id.clone(),
                document_id: unit.document_id.clone(),
                scope: unit.scope,
                branch: unit.branch.clone(),
                operations,
            });
        }
        Ok(strands)
    }

    /// Apply a batch of acknowledgments to one listener's cursors.
    ///
    /// Returns `true` when every acknowledgment matched a cursor and
    /// reported SUCCESS. Cursor positions only ever move forward.
    pub async fn process_acknowledge(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
        acks: &[ListenerRevision],
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&(drive_id.clone(), listener_id.clone()))
            .ok_or_else(|| SyncError::ListenerNotFound {
                drive_id: drive_id.clone(),
                listener_id: listener_id.clone(),
            })?;

        let mut all_success = true;
        for ack in acks {
            let matched = entry.cursors.values_mut().find(|state| {
                state.unit.document_id == ack.document_id
                    && state.unit.scope == ack.scope
                    && state.unit.branch == ack.branch
            });
            match matched {
                Some(state) => {
                    state.acknowledge(ack.revision, ack.status);
                    if ack.status != UpdateStatus::Success {
                        all_success = false;
                    }
                }
                None => {
                    warn!(
                        drive = %drive_id,
                        listener = %listener_id,
                        document = %ack.document_id,
                        scope = %ack.scope,
                        "acknowledgment for untracked unit"
                    );
                    all_success = false;
                }
            }
        }
        Ok(all_success)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────

    /// Deliver one listener's backlog through its transmitter and apply the
    /// resulting acknowledgments. No-op for pull responders.
    pub async fn trigger_listener(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
        now: i64,
    ) -> Result<()> {
        let strands = self.get_strands(drive_id, listener_id).await?;
        if strands.is_empty() {
            return Ok(());
        }

        let transmitter = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&(drive_id.clone(), listener_id.clone()))
                .ok_or_else(|| SyncError::ListenerNotFound {
                    drive_id: drive_id.clone(),
                    listener_id: listener_id.clone(),
                })?;
            if entry.binding.transmitter_type() == TransmitterType::PullResponder {
                return Ok(());
            }
            let expiry = Some(now + self.config.pending_timeout_ms);
            for strand in &strands {
                if let Some(state) = entry.cursors.values_mut().find(|state| {
                    state.unit.document_id == strand.document_id
                        && state.unit.scope == strand.scope
                        && state.unit.branch == strand.branch
                }) {
                    state.mark_pending(expiry);
                }
            }
            entry.binding.build()
        };

        let acks = transmitter.transmit(&strands).await?;
        self.process_acknowledge(drive_id, listener_id, &acks).await?;
        Ok(())
    }

    /// One delivery cycle: trigger every listener with undelivered work,
    /// concurrently, one task per listener.
    ///
    /// Pull responders and listeners with an unexpired PENDING delivery are
    /// skipped; a failed listener is logged and retried next cycle.
    pub async fn trigger_update(self: Arc<Self>, drive_id: Option<&DriveId>, now: i64) {
        let candidates: Vec<(DriveId, ListenerId)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|((drive, _), entry)| {
                    drive_id.map(|id| id == drive).unwrap_or(true)
                        && entry.binding.transmitter_type() != TransmitterType::PullResponder
                        && entry
                            .cursors
                            .values()
                            .any(|state| state.has_backlog() && !state.is_pending(now))
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (drive, listener) in candidates {
            let registry = self.clone();
            tasks.spawn(async move {
                if let Err(e) = registry.trigger_listener(&drive, &listener, now).await {
                    warn!(drive = %drive, listener = %listener, error = %e, "trigger failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Blocking listeners of a drive, for synchronous triggering on the
    /// write path.
    pub async fn blocking_listeners(&self, drive_id: &DriveId) -> Vec<ListenerId> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|((drive, _), entry)| drive == drive_id && entry.listener.block)
            .map(|((_, listener), _)| listener.clone())
            .collect()
    }

    /// The drive document doubles as the stream for its own units.
    async fn load_stream(
        &self,
        drive_id: &DriveId,
        document_id: &DocumentId,
    ) -> Result<driveline_core::Document> {
        if document_id.as_str() == drive_id.as_str() {
            Ok(self.store.get_drive(drive_id).await?)
        } else {
            Ok(self.store.get_document(drive_id, document_id).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmitter::internal::ChannelReceiver;
    use driveline_core::{
        apply_operations, drive, new_drive, CallInfo, Document, DriveReducer, ListenerFilter,
        Operation, Reducer, ReducerError, Scope, MAIN_BRANCH,
    };
    use driveline_store::MemoryStore;
    use serde_json::{json, Value};

    struct Counter;

    impl Reducer for Counter {
        fn apply(
            &self,
            state: &Value,
            operation: &Operation,
        ) -> std::result::Result<(Value, Vec<driveline_core::Signal>), ReducerError> {
            let current = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            let delta = operation
                .input
                .get("delta")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok((json!({ "count": current + delta }), Vec::new()))
        }
    }

    async fn fixture() -> (Arc<ListenerRegistry>, Arc<dyn DocumentStore>, DriveId) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let drive_id = DriveId::new("d1");
        let mut drive_doc = new_drive(&drive_id, "Test", 1000);
        let add = drive::ops::add_file(0, &"doc-1".into(), "Doc", "test/counter", None, 1000);
        apply_operations(&mut drive_doc, &DriveReducer, &[add]).unwrap();
        store.create_drive(&drive_id, drive_doc).await.unwrap();
        store
            .create_document(
                &drive_id,
                &DocumentId::new("doc-1"),
                Document::new("doc-1".into(), "test/counter", json!({"count": 0}), 1000),
            )
            .await
            .unwrap();

        let registry = Arc::new(ListenerRegistry::new(
            store.clone(),
            RegistryConfig::default(),
        ));
        (registry, store, drive_id)
    }

    fn listener(drive_id: &DriveId, id: &str, call_info: CallInfo) -> Listener {
        Listener {
            id: ListenerId::new(id),
            drive_id: drive_id.clone(),
            label: id.to_string(),
            system: false,
            block: false,
            filter: ListenerFilter::all().with_document_types(["test/counter"]),
            call_info,
        }
    }

    /// Apply a batch through the engine, persist it, then surface the new
    /// revision to the registry.
    async fn persist_batch(
        registry: &ListenerRegistry,
        store: &Arc<dyn DocumentStore>,
        drive_id: &DriveId,
        batch: &[Operation],
    ) {
        let doc_id = DocumentId::new("doc-1");
        let mut document = store.get_document(drive_id, &doc_id).await.unwrap();
        let outcome = apply_operations(&mut document, &Counter, batch).unwrap();
        store
            .add_document_operations(drive_id, &doc_id, &outcome.operations, &document)
            .await
            .unwrap();

        registry
            .update_sync_revision(&SynchronizationUnit {
                sync_id: SyncUnitId::derive(&doc_id, Scope::Global),
                drive_id: drive_id.clone(),
                document_id: doc_id,
                scope: Scope::Global,
                branch: MAIN_BRANCH.to_string(),
                document_type: "test/counter".to_string(),
                revision: document.revision(Scope::Global),
                last_updated: 2000,
            })
            .await;
    }

    async fn append_counter_ops(
        registry: &ListenerRegistry,
        store: &Arc<dyn DocumentStore>,
        drive_id: &DriveId,
        start: u64,
        count: u64,
    ) {
        let batch: Vec<Operation> = (start..start + count)
            .map(|i| Operation::new(i, "ADD", json!({"delta": 1}), Scope::Global, 2000))
            .collect();
        persist_batch(registry, store, drive_id, &batch).await;
    }

    #[tokio::test]
    async fn test_binding_must_match_call_info() {
        let (registry, _store, drive_id) = fixture().await;
        let result = registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::push("remote", "addr")),
                TransmitterBinding::PullResponder,
            )
            .await;
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_strands_follow_listener_revision() {
        let (registry, store, drive_id) = fixture().await;
        registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::pull_responder("remote")),
                TransmitterBinding::PullResponder,
            )
            .await
            .unwrap();

        let listener_id = ListenerId::new("l1");
        assert!(registry
            .get_strands(&drive_id, &listener_id)
            .await
            .unwrap()
            .is_empty());

        append_counter_ops(&registry, &store, &drive_id, 0, 3).await;

        let strands = registry.get_strands(&drive_id, &listener_id).await.unwrap();
        assert_eq!(strands.len(), 1);
        assert_eq!(strands[0].operations.len(), 3);
        assert_eq!(strands[0].operations[0].index, 0);

        // Consume up to index 1; only index 2 remains.
        let ack = strands[0].ack(1, UpdateStatus::Success);
        assert!(registry
            .process_acknowledge(&drive_id, &listener_id, &[ack])
            .await
            .unwrap());

        let strands = registry.get_strands(&drive_id, &listener_id).await.unwrap();
        assert_eq!(strands[0].operations.len(), 1);
        assert_eq!(strands[0].operations[0].index, 2);
    }

    #[tokio::test]
    async fn test_trigger_delivers_to_internal_listener() {
        let (registry, store, drive_id) = fixture().await;
        let (receiver, mut inbox) = ChannelReceiver::new();
        registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::internal("cb")),
                TransmitterBinding::Internal(Arc::new(receiver)),
            )
            .await
            .unwrap();

        append_counter_ops(&registry, &store, &drive_id, 0, 2).await;
        registry.clone().trigger_update(Some(&drive_id), 5000).await;

        let delivered = inbox.recv().await.unwrap();
        assert_eq!(delivered.operations.len(), 2);

        // Fully acknowledged: nothing left and no spurious redelivery.
        let listener_id = ListenerId::new("l1");
        assert!(registry
            .get_strands(&drive_id, &listener_id)
            .await
            .unwrap()
            .is_empty());
        registry.clone().trigger_update(Some(&drive_id), 6000).await;
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_blocks_until_expiry() {
        let (registry, store, drive_id) = fixture().await;
        registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::pull_responder("remote")),
                TransmitterBinding::PullResponder,
            )
            .await
            .unwrap();
        append_counter_ops(&registry, &store, &drive_id, 0, 1).await;

        let listener_id = ListenerId::new("l1");
        {
            let mut entries = registry.entries.write().await;
            let entry = entries
                .get_mut(&(drive_id.clone(), listener_id.clone()))
                .unwrap();
            for state in entry.cursors.values_mut() {
                state.mark_pending(Some(10_000));
            }
        }

        let states = registry
            .listener_states(&drive_id, &listener_id)
            .await
            .unwrap();
        assert!(states
            .iter()
            .filter(|s| s.has_backlog())
            .all(|s| s.is_pending(9000) && !s.is_pending(10_000)));
    }

    #[tokio::test]
    async fn test_unmatched_filter_gets_no_cursors() {
        let (registry, _store, drive_id) = fixture().await;
        let mut unmatched = listener(&drive_id, "l1", CallInfo::pull_responder("remote"));
        unmatched.filter = ListenerFilter::all().with_document_types(["other/model"]);
        registry
            .add_listener(unmatched, TransmitterBinding::PullResponder)
            .await
            .unwrap();

        let states = registry
            .listener_states(&drive_id, &ListenerId::new("l1"))
            .await
            .unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_collapsed_undo_is_not_redelivered_after_ack() {
        let (registry, store, drive_id) = fixture().await;
        registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::pull_responder("remote")),
                TransmitterBinding::PullResponder,
            )
            .await
            .unwrap();
        let listener_id = ListenerId::new("l1");

        append_counter_ops(&registry, &store, &drive_id, 0, 2).await;
        persist_batch(
            &registry,
            &store,
            &drive_id,
            &[Operation::noop(2, 1, Scope::Global, 3000)],
        )
        .await;

        let strands = registry.get_strands(&drive_id, &listener_id).await.unwrap();
        let ack = strands[0].ack_all();
        registry
            .process_acknowledge(&drive_id, &listener_id, &[ack])
            .await
            .unwrap();

        // A second undo merges into the trailing no-op: same index, summed
        // skip, revision unchanged.
        persist_batch(
            &registry,
            &store,
            &drive_id,
            &[Operation::noop(2, 1, Scope::Global, 3001)],
        )
        .await;

        let doc_id = DocumentId::new("doc-1");
        let document = store.get_document(&drive_id, &doc_id).await.unwrap();
        assert_eq!(document.revision(Scope::Global), 2);
        assert_eq!(document.operations(Scope::Global).last().unwrap().skip, 2);

        // The consumer acknowledged index 2 already; the merged entry keeps
        // that index, so the enlarged skip is never offered again. Anyone
        // needing the merged undo must rewind below its index.
        assert!(registry
            .get_strands(&drive_id, &listener_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove_listener_and_drive() {
        let (registry, _store, drive_id) = fixture().await;
        registry
            .add_listener(
                listener(&drive_id, "l1", CallInfo::pull_responder("remote")),
                TransmitterBinding::PullResponder,
            )
            .await
            .unwrap();

        assert!(registry.remove_listener(&drive_id, &ListenerId::new("l1")).await);
        // Removing again is a no-op, not an error.
        assert!(!registry.remove_listener(&drive_id, &ListenerId::new("l1")).await);
        assert!(registry.listeners(&drive_id).await.is_empty());

        registry
            .add_listener(
                listener(&drive_id, "l2", CallInfo::pull_responder("remote")),
                TransmitterBinding::PullResponder,
            )
            .await
            .unwrap();
        registry.remove_drive(&drive_id).await;
        assert!(registry.listeners(&drive_id).await.is_empty());
    }
}
