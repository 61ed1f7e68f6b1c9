/// Per-collection replication state machine.
///
/// A collection replica owns the local document set of one collection, its
/// operation log, and its sync state for at most one attached network.
/// Local mutations persist through the store, append a CRDT operation to
/// the log, bump the local vector clock, and broadcast the operation to the
/// attached network's peers. Inbound operations merge through the resolver.
///
/// Two flows deliberately bypass CRDT broadcast:
///
/// - In a network configured `private_by_default`, no operation leaves the
///   node unsolicited; peers that explicitly sync-request are still served
///   from the log.
/// - Documents staged for posting (`_stage = "post-pending"`, set
///   explicitly or by the network's `auto_post_classifications`) are not
///   replicated at all; each sync cycle converts them to transactions for
///   the configured posting network and submits them through the injected
///   [`GraphClient`].
use crate::crdt::{self, apply_operation};
use crate::error::{MeshError, MeshResult};
use crate::network::{
    CollectionPayload, MessageType, NetworkManager, OperationPayload, ProtocolMessage,
    SyncRequestPayload, SyncResponsePayload,
};
use crate::store::DocumentStore;
use crate::types::{
    CrdtOperation, DistributedDocument, Document, OperationKind, VectorClock,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Oldest log entries are discarded beyond this many operations.
pub const DEFAULT_OP_LOG_CAPACITY: usize = 10_000;

/// A sync left in progress auto-resets after this long.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Stage marker for documents awaiting out-of-band posting.
pub const STAGE_POST_PENDING: &str = "post-pending";

/// Payload field driving auto-staging.
const CLASSIFICATION_FIELD: &str = "classification";

/// Snapshot of a replica's sync state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncState {
    pub local_vector: VectorClock,
    pub last_sync: DateTime<Utc>,
    pub pending_ops: Vec<CrdtOperation>,
    pub staged_entries: Vec<String>,
    pub sync_in_progress: bool,
}

/// A staged document converted for out-of-band submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTransaction {
    pub network_id: String,
    pub collection: String,
    pub document_id: String,
    pub entry_type: String,
    pub payload: serde_json::Map<String, JsonValue>,
}

/// Host-injected client that submits staged documents to a posting network.
#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn submit(&self, transaction: PostTransaction) -> MeshResult<()>;
}

/// Per-document replication metadata kept alongside the stored regular form.
///
/// Tombstones live here after the document file is removed, so
/// reconciliation still sees them.
#[derive(Debug, Clone)]
struct DocMeta {
    vector: VectorClock,
    timestamp: i64,
    peer_id: String,
    deleted: bool,
    stage: Option<String>,
}

struct ReplicaState {
    attached: Option<String>,
    local_vector: VectorClock,
    last_sync: DateTime<Utc>,
    pending_ops: Vec<CrdtOperation>,
    staged_entries: Vec<String>,
    sync_in_progress: bool,
    op_log: VecDeque<CrdtOperation>,
    meta: HashMap<String, DocMeta>,
    sync_timeout: Duration,
}

/// The replication state machine for one collection.
pub struct CollectionReplica {
    name: String,
    store: Arc<DocumentStore>,
    network: NetworkManager,
    state: Arc<Mutex<ReplicaState>>,
    graph_client: RwLock<Option<Arc<dyn GraphClient>>>,
}

impl CollectionReplica {
    /// Create a replica and register its message handlers.
    pub fn create(
        name: impl Into<String>,
        store: Arc<DocumentStore>,
        network: NetworkManager,
    ) -> Arc<Self> {
        let replica = Arc::new(Self {
            name: name.into(),
            store,
            network: network.clone(),
            state: Arc::new(Mutex::new(ReplicaState {
                attached: None,
                local_vector: VectorClock::new(),
                last_sync: Utc::now(),
                pending_ops: Vec::new(),
                staged_entries: Vec::new(),
                sync_in_progress: false,
                op_log: VecDeque::new(),
                meta: HashMap::new(),
                sync_timeout: DEFAULT_SYNC_TIMEOUT,
            })),
            graph_client: RwLock::new(None),
        });

        for message_type in [
            MessageType::Operation,
            MessageType::SyncRequest,
            MessageType::SyncResponse,
            MessageType::CollectionRequest,
        ] {
            let handler_replica = replica.clone();
            network.on(
                message_type,
                Arc::new(move |message: ProtocolMessage| {
                    let replica = handler_replica.clone();
                    async move {
                        if let Err(e) = replica.handle_message(message).await {
                            // A malformed peer message must not take down
                            // the replica.
                            warn!(collection = %replica.name, error = %e, "inbound message failed");
                        }
                    }
                    .boxed()
                }),
            );
        }

        replica
    }

    /// The collection this replica manages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inject the posting client used for staged documents.
    pub async fn set_graph_client(&self, client: Arc<dyn GraphClient>) {
        *self.graph_client.write().await = Some(client);
    }

    /// Override the sync auto-reset timeout.
    pub async fn set_sync_timeout(&self, timeout: Duration) {
        self.state.lock().await.sync_timeout = timeout;
    }

    // ────────────────────────────────────────────────────────────────────
    // Local mutations
    // ────────────────────────────────────────────────────────────────────

    /// Insert a document locally and replicate it.
    pub async fn insert(&self, mut doc: Document) -> MeshResult<()> {
        let explicit_stage = match doc.payload.remove("_stage") {
            Some(JsonValue::String(s)) => Some(s),
            Some(other) => {
                return Err(MeshError::invalid(format!(
                    "_stage must be a string, got {other}"
                )))
            }
            None => None,
        };

        self.store.insert(&self.name, doc.clone()).await?;
        self.record_mutation(OperationKind::Insert, doc, explicit_stage)
            .await
    }

    /// Merge fields into a document locally and replicate the result.
    pub async fn update(
        &self,
        id: &str,
        changes: serde_json::Map<String, JsonValue>,
    ) -> MeshResult<Document> {
        let updated = self.store.update(&self.name, id, changes).await?;
        self.record_mutation(OperationKind::Update, updated.clone(), None)
            .await?;
        Ok(updated)
    }

    /// Delete a document locally and replicate the tombstone.
    pub async fn delete(&self, id: &str) -> MeshResult<()> {
        self.store.delete(&self.name, id).await?;

        let broadcast = {
            let mut state = self.state.lock().await;
            state.local_vector.increment(self.network.peer_id());
            let vector = state.local_vector.clone();
            let timestamp = crdt::now_ms();

            state.meta.insert(
                id.to_string(),
                DocMeta {
                    vector: vector.clone(),
                    timestamp,
                    peer_id: self.network.peer_id().to_string(),
                    deleted: true,
                    stage: None,
                },
            );

            let op = CrdtOperation {
                op_id: Uuid::new_v4().to_string(),
                kind: OperationKind::Delete,
                collection: self.name.clone(),
                document_id: id.to_string(),
                data: None,
                vector,
                timestamp,
                peer_id: self.network.peer_id().to_string(),
            };
            self.append_log(&mut state, op.clone());
            self.broadcast_target(&state).map(|network_id| (network_id, op))
        };

        if let Some((network_id, op)) = broadcast {
            self.broadcast_operation(&network_id, op).await;
        }
        Ok(())
    }

    /// Fetch a document through the store.
    pub async fn find(&self, id: &str) -> MeshResult<Document> {
        self.store.find(&self.name, id).await
    }

    /// Every live document in the collection.
    pub async fn find_all(&self) -> MeshResult<Vec<Document>> {
        self.store.find_all(&self.name).await
    }

    /// Clock, log, stage bookkeeping shared by insert and update.
    async fn record_mutation(
        &self,
        kind: OperationKind,
        doc: Document,
        explicit_stage: Option<String>,
    ) -> MeshResult<()> {
        let config = {
            let state = self.state.lock().await;
            state
                .attached
                .as_ref()
                .and_then(|network_id| self.network.network_config(network_id))
        };

        let auto_staged = config
            .as_ref()
            .map(|config| {
                doc.payload
                    .get(CLASSIFICATION_FIELD)
                    .and_then(|v| v.as_str())
                    .is_some_and(|c| config.auto_post_classifications.contains(c))
            })
            .unwrap_or(false);
        let stage = explicit_stage.or_else(|| auto_staged.then(|| STAGE_POST_PENDING.to_string()));

        let mut state = self.state.lock().await;

        if let Some(stage) = stage {
            // Staged documents are not replicated as CRDT ops; they travel
            // out of band on the next sync cycle.
            debug!(collection = %self.name, id = %doc.id, "staged for posting");
            let vector = state.local_vector.clone();
            state.meta.insert(
                doc.id.clone(),
                DocMeta {
                    vector,
                    timestamp: crdt::now_ms(),
                    peer_id: self.network.peer_id().to_string(),
                    deleted: false,
                    stage: Some(stage),
                },
            );
            if !state.staged_entries.contains(&doc.id) {
                state.staged_entries.push(doc.id.clone());
            }
            return Ok(());
        }

        state.local_vector.increment(self.network.peer_id());
        let vector = state.local_vector.clone();
        let timestamp = crdt::now_ms();

        state.meta.insert(
            doc.id.clone(),
            DocMeta {
                vector: vector.clone(),
                timestamp,
                peer_id: self.network.peer_id().to_string(),
                deleted: false,
                stage: None,
            },
        );

        let data = DistributedDocument {
            id: doc.id.clone(),
            entry_type: doc.entry_type.clone(),
            vector: vector.clone(),
            timestamp,
            peer_id: self.network.peer_id().to_string(),
            deleted: false,
            stage: None,
            payload: doc.payload,
        };
        let op = CrdtOperation {
            op_id: Uuid::new_v4().to_string(),
            kind,
            collection: self.name.clone(),
            document_id: doc.id,
            data: Some(data),
            vector,
            timestamp,
            peer_id: self.network.peer_id().to_string(),
        };
        self.append_log(&mut state, op.clone());

        // The clock increment lands before the broadcast: the lock is only
        // released once the op is in the log.
        let broadcast = self.broadcast_target(&state).map(|network_id| (network_id, op));
        drop(state);

        if let Some((network_id, op)) = broadcast {
            self.broadcast_operation(&network_id, op).await;
        }
        Ok(())
    }

    fn append_log(&self, state: &mut ReplicaState, op: CrdtOperation) {
        state.op_log.push_back(op);
        while state.op_log.len() > DEFAULT_OP_LOG_CAPACITY {
            state.op_log.pop_front();
        }
    }

    /// The network to broadcast on, unless it is private-by-default.
    fn broadcast_target(&self, state: &ReplicaState) -> Option<String> {
        let network_id = state.attached.as_ref()?;
        let config = self.network.network_config(network_id)?;
        if config.private_by_default {
            return None;
        }
        Some(network_id.clone())
    }

    async fn broadcast_operation(&self, network_id: &str, op: CrdtOperation) {
        let payload = OperationPayload {
            collection: self.name.clone(),
            operation: op,
        };
        let message = match serde_json::to_value(&payload) {
            Ok(payload) => ProtocolMessage::new(
                MessageType::Operation,
                network_id,
                self.network.peer_id().to_string(),
                payload,
            ),
            Err(e) => {
                warn!(collection = %self.name, error = %e, "operation encode failed");
                return;
            }
        };
        if let Err(e) = self.network.broadcast(network_id, &message).await {
            warn!(collection = %self.name, error = %e, "operation broadcast failed");
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Attachment
    // ────────────────────────────────────────────────────────────────────

    /// Attach this collection to a network and issue an initial sync.
    pub async fn attach(&self, network_id: &str) -> MeshResult<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(current) = &state.attached {
                return Err(MeshError::AlreadyAttached {
                    collection: self.name.clone(),
                    network_id: current.clone(),
                });
            }
            self.network.register_collection(&self.name, network_id)?;
            state.attached = Some(network_id.to_string());
            state.last_sync = Utc::now();
            state.pending_ops.clear();
            state.staged_entries.clear();
            state.sync_in_progress = false;
        }

        let announce = ProtocolMessage::new(
            MessageType::CollectionAnnounce,
            network_id,
            self.network.peer_id().to_string(),
            serde_json::to_value(CollectionPayload {
                collection: self.name.clone(),
            })?,
        );
        let _ = self.network.broadcast(network_id, &announce).await;

        self.force_sync().await
    }

    /// Detach from the current network. The operation log is retained to
    /// serve future attachers.
    pub async fn detach(&self) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        if state.attached.take().is_none() {
            return Err(MeshError::NotAttached {
                collection: self.name.clone(),
            });
        }
        self.network.unregister_collection(&self.name);
        state.pending_ops.clear();
        state.staged_entries.clear();
        state.sync_in_progress = false;
        Ok(())
    }

    /// The attached network id, if any.
    pub async fn attached_network(&self) -> Option<String> {
        self.state.lock().await.attached.clone()
    }

    /// Snapshot the sync state, or `None` when detached.
    pub async fn sync_state(&self) -> Option<SyncState> {
        let state = self.state.lock().await;
        state.attached.as_ref()?;
        Some(SyncState {
            local_vector: state.local_vector.clone(),
            last_sync: state.last_sync,
            pending_ops: state.pending_ops.clone(),
            staged_entries: state.staged_entries.clone(),
            sync_in_progress: state.sync_in_progress,
        })
    }

    /// The local vector clock.
    pub async fn local_vector(&self) -> VectorClock {
        self.state.lock().await.local_vector.clone()
    }

    /// Current contents of the operation log, oldest first.
    pub async fn op_log(&self) -> Vec<CrdtOperation> {
        self.state.lock().await.op_log.iter().cloned().collect()
    }

    /// The current stage marker for a document, if any.
    pub async fn stage(&self, id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.meta.get(id).and_then(|meta| meta.stage.clone())
    }

    /// The retained tombstone for a document, if any.
    pub async fn tombstone(&self, id: &str) -> Option<DistributedDocument> {
        let state = self.state.lock().await;
        let meta = state.meta.get(id)?;
        if !meta.deleted {
            return None;
        }
        Some(DistributedDocument {
            id: id.to_string(),
            entry_type: crate::types::EntryType::Other("TOMBSTONE".to_string()),
            vector: meta.vector.clone(),
            timestamp: meta.timestamp,
            peer_id: meta.peer_id.clone(),
            deleted: true,
            stage: None,
            payload: serde_json::Map::new(),
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // Sync
    // ────────────────────────────────────────────────────────────────────

    /// Broadcast a sync request unless one is already in flight.
    ///
    /// The in-progress flag auto-resets after the sync timeout, so a peer
    /// that never answers cannot wedge the replica. Each cycle also flushes
    /// staged documents through the graph client.
    pub async fn force_sync(&self) -> MeshResult<()> {
        let (network_id, request, timeout) = {
            let mut state = self.state.lock().await;
            let network_id = state.attached.clone().ok_or_else(|| MeshError::NotAttached {
                collection: self.name.clone(),
            })?;
            if state.sync_in_progress {
                debug!(collection = %self.name, "sync already in progress");
                return Ok(());
            }
            state.sync_in_progress = true;
            let request = SyncRequestPayload {
                collection: self.name.clone(),
                vector: state.local_vector.clone(),
            };
            (network_id, request, state.sync_timeout)
        };

        let message = ProtocolMessage::new(
            MessageType::SyncRequest,
            network_id.clone(),
            self.network.peer_id().to_string(),
            serde_json::to_value(&request)?,
        );
        let _ = self.network.broadcast(&network_id, &message).await;

        self.process_staged(&network_id).await;

        // The timeout task only needs the state cell, not the whole replica.
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = state.lock().await;
            if state.sync_in_progress {
                state.sync_in_progress = false;
            }
        });

        Ok(())
    }

    /// Submit every staged document to the posting network.
    async fn process_staged(&self, attached_network: &str) {
        let client = self.graph_client.read().await.clone();
        let Some(client) = client else {
            return;
        };

        let (staged, posting_network) = {
            let state = self.state.lock().await;
            let posting = self
                .network
                .network_config(attached_network)
                .and_then(|c| c.default_posting_network)
                .unwrap_or_else(|| attached_network.to_string());
            (state.staged_entries.clone(), posting)
        };

        for id in staged {
            let doc = match self.store.try_find(&self.name, &id).await {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    let mut state = self.state.lock().await;
                    state.staged_entries.retain(|staged_id| staged_id != &id);
                    continue;
                }
                Err(e) => {
                    warn!(collection = %self.name, id = %id, error = %e, "staged read failed");
                    continue;
                }
            };

            let transaction = PostTransaction {
                network_id: posting_network.clone(),
                collection: self.name.clone(),
                document_id: doc.id.clone(),
                entry_type: doc.entry_type.as_str().to_string(),
                payload: doc.payload.clone(),
            };

            match client.submit(transaction).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.staged_entries.retain(|staged_id| staged_id != &id);
                    if let Some(meta) = state.meta.get_mut(&id) {
                        meta.stage = None;
                    }
                    debug!(collection = %self.name, id = %id, "staged post submitted");
                }
                Err(e) => {
                    // Left staged; retried on the next cycle.
                    warn!(collection = %self.name, id = %id, error = %e, "staged post failed");
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Inbound messages
    // ────────────────────────────────────────────────────────────────────

    async fn handle_message(&self, message: ProtocolMessage) -> MeshResult<()> {
        // Only handle traffic for the attached network.
        let attached = { self.state.lock().await.attached.clone() };
        let Some(network_id) = attached else {
            return Ok(());
        };
        if message.network_id != network_id {
            return Ok(());
        }

        match message.message_type {
            MessageType::Operation => {
                let payload: OperationPayload = serde_json::from_value(message.payload)?;
                if payload.collection != self.name {
                    return Ok(());
                }
                self.apply_remote_operation(payload.operation).await
            }
            MessageType::SyncRequest => {
                let payload: SyncRequestPayload = serde_json::from_value(message.payload)?;
                if payload.collection != self.name {
                    return Ok(());
                }
                self.answer_sync_request(&network_id, &message.sender_id, payload.vector)
                    .await
            }
            MessageType::SyncResponse => {
                let payload: SyncResponsePayload = serde_json::from_value(message.payload)?;
                if payload.collection != self.name {
                    return Ok(());
                }
                for op in payload.operations {
                    self.apply_remote_operation(op).await?;
                }
                let mut state = self.state.lock().await;
                state.local_vector = state.local_vector.merge(&payload.vector);
                state.last_sync = Utc::now();
                state.sync_in_progress = false;
                Ok(())
            }
            MessageType::CollectionRequest => {
                let payload: CollectionPayload = serde_json::from_value(message.payload)?;
                if payload.collection != self.name {
                    return Ok(());
                }
                let announce = ProtocolMessage::new(
                    MessageType::CollectionAnnounce,
                    network_id,
                    self.network.peer_id().to_string(),
                    serde_json::to_value(CollectionPayload {
                        collection: self.name.clone(),
                    })?,
                );
                self.network.send_to_peer(&message.sender_id, &announce).await
            }
            _ => Ok(()),
        }
    }

    /// Merge a remote operation into local state via the resolver.
    pub async fn apply_remote_operation(&self, op: CrdtOperation) -> MeshResult<()> {
        if op.collection != self.name {
            return Ok(());
        }

        // The state lock is held across the apply so operations for one
        // document land in receipt order.
        let mut state = self.state.lock().await;

        let local = match state.meta.get(&op.document_id) {
            Some(meta) if meta.deleted => Some(DistributedDocument {
                id: op.document_id.clone(),
                entry_type: op
                    .data
                    .as_ref()
                    .map(|d| d.entry_type.clone())
                    .unwrap_or(crate::types::EntryType::Other("TOMBSTONE".to_string())),
                vector: meta.vector.clone(),
                timestamp: meta.timestamp,
                peer_id: meta.peer_id.clone(),
                deleted: true,
                stage: None,
                payload: serde_json::Map::new(),
            }),
            Some(meta) => {
                let stored = self.store.try_find(&self.name, &op.document_id).await?;
                stored.map(|doc| DistributedDocument {
                    id: doc.id,
                    entry_type: doc.entry_type,
                    vector: meta.vector.clone(),
                    timestamp: meta.timestamp,
                    peer_id: meta.peer_id.clone(),
                    deleted: false,
                    stage: meta.stage.clone(),
                    payload: doc.payload,
                })
            }
            None => {
                // Present on disk but never replicated: an empty clock makes
                // any remote version dominate.
                let stored = self.store.try_find(&self.name, &op.document_id).await?;
                stored.map(|doc| DistributedDocument {
                    id: doc.id,
                    entry_type: doc.entry_type,
                    vector: VectorClock::new(),
                    timestamp: 0,
                    peer_id: String::new(),
                    deleted: false,
                    stage: None,
                    payload: doc.payload,
                })
            }
        };

        let resolved = apply_operation(local.as_ref(), &op);

        if let Some(doc) = resolved {
            if doc.deleted {
                match self.store.delete(&self.name, &op.document_id).await {
                    Ok(()) => {}
                    Err(MeshError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                state.meta.insert(
                    op.document_id.clone(),
                    DocMeta {
                        vector: doc.vector,
                        timestamp: doc.timestamp,
                        peer_id: doc.peer_id,
                        deleted: true,
                        stage: None,
                    },
                );
            } else {
                self.store.insert(&self.name, crdt::to_regular(&doc)).await?;
                state.meta.insert(
                    op.document_id.clone(),
                    DocMeta {
                        vector: doc.vector,
                        timestamp: doc.timestamp,
                        peer_id: doc.peer_id,
                        deleted: false,
                        stage: doc.stage,
                    },
                );
            }
        }

        state.local_vector = state.local_vector.merge(&op.vector);
        Ok(())
    }

    /// Serve a peer's sync request with the ops it has not seen.
    async fn answer_sync_request(
        &self,
        network_id: &str,
        requester: &str,
        peer_vector: VectorClock,
    ) -> MeshResult<()> {
        let (operations, vector) = {
            let state = self.state.lock().await;
            let operations: Vec<CrdtOperation> = state
                .op_log
                .iter()
                .filter(|op| op.vector.get(&op.peer_id) > peer_vector.get(&op.peer_id))
                .cloned()
                .collect();
            (operations, state.local_vector.clone())
        };

        debug!(
            collection = %self.name,
            requester = %requester,
            ops = operations.len(),
            "answering sync request"
        );

        let response = ProtocolMessage::new(
            MessageType::SyncResponse,
            network_id,
            self.network.peer_id().to_string(),
            serde_json::to_value(SyncResponsePayload {
                collection: self.name.clone(),
                operations,
                vector,
            })?,
        );
        // The response goes only to the requester.
        self.network.send_to_peer(requester, &response).await
    }
}
