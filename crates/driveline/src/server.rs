//! The drive server: write path, signal dispatch and listener lifecycle.
//!
//! Everything flows through [`DriveServer::add_operations`]: the batch is
//! applied under a per-document lock, accepted operations are persisted
//! together with the post-batch document, reducer signals are dispatched,
//! new revisions are surfaced to the listener registry, and blocking
//! listeners are triggered before the call returns.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use driveline_core::{
    apply_operations, drive_listeners, new_drive, now_millis, AppendOutcome, AppendStatus,
    Document, DocumentId, DriveId, Listener, ListenerId, Operation, ReducerRegistry, Scope,
    Signal, SignalOutcome, TransmitterType, MAIN_BRANCH,
};
use driveline_store::{DocumentStore, StoreError};
use driveline_sync::{
    start_trigger_loop, ListenerRegistry, ListenerRevision, NoPushClients, PushClientFactory,
    RegistryConfig, StrandReceiver, StrandSink, StrandUpdate, SyncUnitId, SynchronizationUnit,
    TransmitterBinding, TriggerConfig, TriggerHandle, UpdateStatus,
};

use crate::error::{Result, ServerError};

/// Server tuning: registry delivery knobs plus trigger-loop timing.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub registry: RegistryConfig,
    pub trigger: TriggerConfig,
}

/// Result of a server-side append: the engine outcome plus the dispatch
/// results of the signals it produced.
#[derive(Debug)]
pub struct AppendResult {
    pub outcome: AppendOutcome,
    pub signal_outcomes: Vec<SignalOutcome>,
}

/// A running driveline node.
pub struct DriveServer {
    store: Arc<dyn DocumentStore>,
    reducers: ReducerRegistry,
    registry: Arc<ListenerRegistry>,
    receivers: RwLock<HashMap<String, Arc<dyn StrandReceiver>>>,
    push_clients: Arc<dyn PushClientFactory>,
    write_locks: Mutex<HashMap<(DriveId, DocumentId), Arc<Mutex<()>>>>,
    config: ServerConfig,
}

impl DriveServer {
    /// Create a server over a store. The drive reducer is always installed;
    /// callers register one reducer per document type they host.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        mut reducers: ReducerRegistry,
        config: ServerConfig,
    ) -> Self {
        reducers.register(
            driveline_core::DRIVE_DOCUMENT_TYPE,
            Arc::new(driveline_core::DriveReducer),
        );
        let registry = Arc::new(ListenerRegistry::new(store.clone(), config.registry.clone()));
        Self {
            store,
            reducers,
            registry,
            receivers: RwLock::new(HashMap::new()),
            push_clients: Arc::new(NoPushClients),
            write_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Install a push client factory for listeners declared with a push
    /// call info.
    pub fn with_push_clients(mut self, factory: Arc<dyn PushClientFactory>) -> Self {
        self.push_clients = factory;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The listener registry.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────
    // Drive and document lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create an empty drive.
    pub async fn add_drive(&self, drive_id: &DriveId, name: &str) -> Result<()> {
        let document = new_drive(drive_id, name, now_millis());
        self.store.create_drive(drive_id, document).await?;
        info!(drive = %drive_id, "drive created");
        Ok(())
    }

    /// Import a drive from an existing document, e.g. when joining a
    /// replication peer.
    pub async fn add_drive_document(&self, drive_id: &DriveId, document: Document) -> Result<()> {
        self.store.create_drive(drive_id, document).await?;
        Ok(())
    }

    pub async fn get_drive(&self, drive_id: &DriveId) -> Result<Document> {
        Ok(self.store.get_drive(drive_id).await?)
    }

    pub async fn get_drives(&self) -> Result<Vec<DriveId>> {
        Ok(self.store.get_drives().await?)
    }

    /// Delete a drive, its stored documents, its listeners and cursors.
    pub async fn delete_drive(&self, drive_id: &DriveId) -> Result<()> {
        self.registry.remove_drive(drive_id).await;
        self.store.delete_drive(drive_id).await?;
        self.write_locks
            .lock()
            .await
            .retain(|(drive, _), _| drive != drive_id);
        info!(drive = %drive_id, "drive deleted");
        Ok(())
    }

    /// Create a document under a drive. The document type must have a
    /// registered reducer.
    pub async fn create_document(
        &self,
        drive_id: &DriveId,
        id: &DocumentId,
        document_type: &str,
        initial_state: serde_json::Value,
    ) -> Result<()> {
        // Fail before persisting anything a later append cannot interpret.
        self.reducers.get(document_type)?;
        let document = Document::new(id.clone(), document_type, initial_state, now_millis());
        self.store.create_document(drive_id, id, document).await?;
        Ok(())
    }

    pub async fn get_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<Document> {
        Ok(self.store.get_document(drive_id, id).await?)
    }

    pub async fn get_documents(&self, drive_id: &DriveId) -> Result<Vec<DocumentId>> {
        Ok(self.store.get_documents(drive_id).await?)
    }

    /// Delete a document and forget its synchronization units.
    pub async fn delete_document(&self, drive_id: &DriveId, id: &DocumentId) -> Result<()> {
        self.store.delete_document(drive_id, id).await?;
        for scope in Scope::ALL {
            self.registry
                .remove_unit(drive_id, &SyncUnitId::derive(id, scope))
                .await;
        }
        self.write_locks
            .lock()
            .await
            .remove(&(drive_id.clone(), id.clone()));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────

    /// Append a batch to a drive's own logs.
    pub async fn add_drive_operations(
        &self,
        drive_id: &DriveId,
        batch: &[Operation],
    ) -> Result<AppendResult> {
        let document_id = DocumentId::new(drive_id.as_str());
        self.add_operations(drive_id, &document_id, batch).await
    }

    /// Append a batch to a document's logs.
    ///
    /// Accepted operations (the full batch on success, the accepted prefix
    /// otherwise) are persisted and stay applied regardless of the outcome
    /// status; the outcome reports how far the batch got and why it stopped.
    pub async fn add_operations(
        &self,
        drive_id: &DriveId,
        document_id: &DocumentId,
        batch: &[Operation],
    ) -> Result<AppendResult> {
        let lock = self.document_lock(drive_id, document_id).await;
        let _guard = lock.lock().await;

        let is_drive = document_id.as_str() == drive_id.as_str();
        let mut document = if is_drive {
            self.store.get_drive(drive_id).await?
        } else {
            self.store.get_document(drive_id, document_id).await?
        };

        let reducer = self.reducers.get(&document.header.document_type)?;
        let outcome = apply_operations(&mut document, reducer.as_ref(), batch)?;

        if !outcome.operations.is_empty() {
            document.header.last_modified_at = now_millis();
            if is_drive {
                self.store
                    .add_drive_operations(drive_id, &outcome.operations, &document)
                    .await?;
            } else {
                self.store
                    .add_document_operations(drive_id, document_id, &outcome.operations, &document)
                    .await?;
            }
        }

        let signal_outcomes = self.dispatch_signals(drive_id, &outcome.signals).await;

        if !outcome.operations.is_empty() {
            self.surface_revisions(drive_id, document_id, &document, &outcome.operations)
                .await;
            let now = now_millis();
            for listener_id in self.registry.blocking_listeners(drive_id).await {
                if let Err(e) = self
                    .registry
                    .trigger_listener(drive_id, &listener_id, now)
                    .await
                {
                    warn!(drive = %drive_id, listener = %listener_id, error = %e, "blocking trigger failed");
                }
            }
        }

        Ok(AppendResult {
            outcome,
            signal_outcomes,
        })
    }

    /// Execute the cross-document actions requested by the reducer. A
    /// failed signal is recorded, never unwound.
    async fn dispatch_signals(
        &self,
        drive_id: &DriveId,
        signals: &[Signal],
    ) -> Vec<SignalOutcome> {
        let mut outcomes = Vec::with_capacity(signals.len());
        for signal in signals {
            let result = self.dispatch_one(drive_id, signal).await;
            if let Err(e) = &result {
                warn!(drive = %drive_id, ?signal, error = %e, "signal dispatch failed");
            }
            outcomes.push(SignalOutcome {
                signal: signal.clone(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        outcomes
    }

    async fn dispatch_one(&self, drive_id: &DriveId, signal: &Signal) -> Result<()> {
        match signal {
            Signal::CreateChildDocument {
                id,
                document_type,
                document,
            } => {
                let document = document.clone().unwrap_or_else(|| {
                    Document::new(id.clone(), document_type, serde_json::Value::Null, now_millis())
                });
                self.store.create_document(drive_id, id, document).await?;
            }
            Signal::DeleteChildDocument { id } => {
                self.delete_document(drive_id, id).await?;
            }
            Signal::CopyChildDocument {
                source_id,
                target_id,
            } => {
                let mut copy = self.store.get_document(drive_id, source_id).await?;
                copy.header.id = target_id.clone();
                copy.header.created_at = now_millis();
                self.store.create_document(drive_id, target_id, copy).await?;
            }
        }
        Ok(())
    }

    /// Tell the registry about the revisions the batch moved.
    async fn surface_revisions(
        &self,
        drive_id: &DriveId,
        document_id: &DocumentId,
        document: &Document,
        accepted: &[Operation],
    ) {
        let scopes: BTreeSet<Scope> = accepted.iter().map(|op| op.scope).collect();
        let now = now_millis();
        for scope in scopes {
            self.registry
                .update_sync_revision(&SynchronizationUnit {
                    sync_id: SyncUnitId::derive(document_id, scope),
                    drive_id: drive_id.clone(),
                    document_id: document_id.clone(),
                    scope,
                    branch: MAIN_BRANCH.to_string(),
                    document_type: document.header.document_type.clone(),
                    revision: document.revision(scope),
                    last_updated: now,
                })
                .await;
        }
    }

    async fn document_lock(
        &self,
        drive_id: &DriveId,
        document_id: &DocumentId,
    ) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry((drive_id.clone(), document_id.clone()))
            .or_default()
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Listener lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Make an in-process receiver available to internal listeners under a
    /// name. Must happen before `load` rebuilds listeners that reference it.
    pub async fn register_receiver(&self, name: impl Into<String>, receiver: Arc<dyn StrandReceiver>) {
        self.receivers.write().await.insert(name.into(), receiver);
    }

    /// Register a listener: activate it in the registry and persist its
    /// declaration in the drive's local state. An empty listener id is
    /// replaced with a generated one.
    pub async fn register_listener(
        &self,
        mut listener: Listener,
        binding: TransmitterBinding,
    ) -> Result<ListenerId> {
        if listener.id.as_str().is_empty() {
            listener.id = generate_listener_id();
        }
        let listener_id = listener.id.clone();
        let drive_id = listener.drive_id.clone();

        self.registry.add_listener(listener.clone(), binding).await?;

        if let Err(e) = self
            .persist_drive_op(&drive_id, |index, now| {
                driveline_core::drive::ops::add_listener(index, &listener, now)
            })
            .await
        {
            // Keep registration and persistence in agreement.
            self.registry.remove_listener(&drive_id, &listener_id).await;
            return Err(e);
        }
        info!(drive = %drive_id, listener = %listener_id, "listener registered");
        Ok(listener_id)
    }

    /// Unregister a listener and drop its persisted declaration.
    ///
    /// Idempotent: returns whether anything was removed.
    pub async fn unregister_listener(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
    ) -> Result<bool> {
        if !self.registry.remove_listener(drive_id, listener_id).await {
            return Ok(false);
        }
        self.persist_drive_op(drive_id, |index, now| {
            driveline_core::drive::ops::remove_listener(index, listener_id, now)
        })
        .await?;
        Ok(true)
    }

    /// Listeners currently active on a drive.
    pub async fn listeners(&self, drive_id: &DriveId) -> Vec<Listener> {
        self.registry.listeners(drive_id).await
    }

    /// Append one local-scope drive operation, retrying on index races with
    /// concurrent drive writes.
    async fn persist_drive_op<F>(&self, drive_id: &DriveId, build: F) -> Result<()>
    where
        F: Fn(u64, i64) -> Operation,
    {
        for _ in 0..3 {
            let drive = self.store.get_drive(drive_id).await?;
            let index = (drive.revision(Scope::Local) + 1) as u64;
            let op = build(index, now_millis());
            let result = self.add_drive_operations(drive_id, &[op]).await?;
            match result.outcome.status {
                AppendStatus::Conflict => continue,
                AppendStatus::Success => return Ok(()),
                _ => {
                    return Err(ServerError::Core(driveline_core::CoreError::Validation(
                        result
                            .outcome
                            .error
                            .unwrap_or_else(|| "drive operation rejected".to_string()),
                    )))
                }
            }
        }
        Err(ServerError::Core(driveline_core::CoreError::Validation(
            "drive operation lost the index race".to_string(),
        )))
    }

    /// Rebuild in-memory listener state from the declarations persisted in
    /// each drive. Called once at startup, after receivers are registered.
    pub async fn load(&self) -> Result<()> {
        for drive_id in self.store.get_drives().await? {
            let drive = self.store.get_drive(&drive_id).await?;
            let listeners = drive_listeners(&drive)
                .map_err(|e| ServerError::Core(driveline_core::CoreError::from(e)))?;
            for listener in listeners {
                match self.binding_for(&listener).await {
                    Ok(binding) => {
                        if let Err(e) = self.registry.add_listener(listener.clone(), binding).await
                        {
                            warn!(drive = %drive_id, listener = %listener.id, error = %e, "listener rebuild failed");
                        }
                    }
                    Err(e) => {
                        warn!(drive = %drive_id, listener = %listener.id, error = %e, "listener left unbound");
                    }
                }
            }
            debug!(drive = %drive_id, "drive listeners rebuilt");
        }
        Ok(())
    }

    async fn binding_for(&self, listener: &Listener) -> Result<TransmitterBinding> {
        match listener.call_info.transmitter_type {
            TransmitterType::Internal => self
                .receivers
                .read()
                .await
                .get(&listener.call_info.name)
                .cloned()
                .map(TransmitterBinding::Internal)
                .ok_or_else(|| ServerError::UnknownReceiver(listener.call_info.name.clone())),
            TransmitterType::Push => {
                let client = self.push_clients.client(&listener.call_info).await?;
                Ok(TransmitterBinding::Push(client))
            }
            TransmitterType::PullResponder => Ok(TransmitterBinding::PullResponder),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Synchronization surface
    // ─────────────────────────────────────────────────────────────────────

    /// The undelivered strands of one listener (the pull responder surface).
    pub async fn get_strands(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
    ) -> Result<Vec<StrandUpdate>> {
        Ok(self.registry.get_strands(drive_id, listener_id).await?)
    }

    /// Apply a remote consumer's acknowledgments.
    pub async fn process_acknowledge(
        &self,
        drive_id: &DriveId,
        listener_id: &ListenerId,
        acks: &[ListenerRevision],
    ) -> Result<bool> {
        Ok(self
            .registry
            .process_acknowledge(drive_id, listener_id, acks)
            .await?)
    }

    /// Run one delivery cycle over all drives.
    pub async fn trigger_update(&self) {
        self.registry.clone().trigger_update(None, now_millis()).await;
    }

    /// Spawn the periodic delivery loop.
    pub fn start_trigger_loop(&self) -> TriggerHandle {
        start_trigger_loop(self.registry.clone(), self.config.trigger.clone())
    }

    /// Start pulling from a remote pull responder, applying fetched strands
    /// through this server's write path.
    pub fn start_pull(
        self: Arc<Self>,
        remote: Arc<dyn driveline_sync::PullRemote>,
        config: driveline_sync::PollerConfig,
    ) -> driveline_sync::PollerHandle {
        driveline_sync::start_poller(remote, self, config)
    }
}

/// Incoming side of pull replication: strands pulled from a remote peer
/// land on the local write path.
#[async_trait]
impl StrandSink for DriveServer {
    async fn apply_strand(&self, strand: StrandUpdate) -> ListenerRevision {
        let document_id = strand.document_id.clone();
        let is_drive = document_id.as_str() == strand.drive_id.as_str();

        let local = if is_drive {
            self.store.get_drive(&strand.drive_id).await
        } else {
            self.store.get_document(&strand.drive_id, &document_id).await
        };
        let document = match local {
            Ok(document) => document,
            Err(StoreError::NotFound(_)) => return strand.ack_none(UpdateStatus::Missing),
            Err(e) => {
                warn!(document = %document_id, error = %e, "pull target unreadable");
                return strand.ack_none(UpdateStatus::Error);
            }
        };

        // The remote resends everything past our last acknowledgment; drop
        // what we already hold instead of conflicting on it. This also drops
        // a no-op whose skip grew by collapsing on the source: the merged
        // entry keeps its index, so it never clears this filter once that
        // index was acknowledged.
        let local_revision = document.revision(strand.scope);
        let fresh: Vec<Operation> = strand
            .operations
            .iter()
            .filter(|op| op.index as i64 > local_revision)
            .cloned()
            .collect();
        if fresh.is_empty() {
            return strand.ack(local_revision, UpdateStatus::Success);
        }

        match self.add_operations(&strand.drive_id, &document_id, &fresh).await {
            Ok(result) => {
                let applied = result
                    .outcome
                    .operations
                    .last()
                    .map(|op| op.index as i64)
                    .unwrap_or(local_revision)
                    .max(local_revision);
                let status = if result.outcome.status == AppendStatus::Success {
                    UpdateStatus::Success
                } else {
                    UpdateStatus::Error
                };
                strand.ack(applied, status)
            }
            Err(e) => {
                warn!(document = %document_id, error = %e, "pulled strand rejected");
                strand.ack(local_revision, UpdateStatus::Error)
            }
        }
    }
}

fn generate_listener_id() -> ListenerId {
    let token: u64 = rand::thread_rng().gen();
    ListenerId::new(format!("listener-{token:016x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_listener_ids_are_unique() {
        let a = generate_listener_id();
        let b = generate_listener_id();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("listener-"));
    }
}
