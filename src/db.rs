/// Database facade.
///
/// Owns the document store, the network manager, and the map of collection
/// replicas. Collections are created lazily and idempotently; networks are
/// created, joined and left by delegating to the network manager. The §6
/// command language routes through here: reads go through the planner-backed
/// executor, mutations go through the owning replica so they replicate.
use crate::crypto::MasterKey;
use crate::error::MeshResult;
use crate::index::{IndexDefinition, IndexKind};
use crate::network::{NetworkConfig, NetworkManager, NetworkStats};
use crate::query::{self, Command, QueryExecutor};
use crate::replica::{CollectionReplica, GraphClient};
use crate::store::DocumentStore;
use crate::types::{Document, EntryType};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Documents returned by a GET.
    Documents(Vec<Document>),
    /// A mutation or DDL command completed.
    Ack,
}

/// Aggregate statistics over the whole node.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub collections: usize,
    pub documents_per_collection: HashMap<String, u64>,
    pub networks: usize,
}

/// A meshdb node: full local replica plus its network presence.
pub struct Database {
    store: Arc<DocumentStore>,
    network: NetworkManager,
    executor: QueryExecutor,
    collections: Mutex<HashMap<String, Arc<CollectionReplica>>>,
}

impl Database {
    /// Open a node rooted at `base_dir` and start listening for peers.
    pub async fn open(base_dir: impl Into<PathBuf>) -> MeshResult<Self> {
        let store = Arc::new(DocumentStore::open(base_dir).await?);
        let network = NetworkManager::new();
        let addr = network.start().await?;
        info!(peer_id = %network.peer_id(), %addr, "database open");

        Ok(Self {
            executor: QueryExecutor::new(store.clone()),
            store,
            network,
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> &str {
        self.network.peer_id()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// The network manager.
    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Install the process-wide master encryption key.
    pub fn install_master_key(&self, key: MasterKey) -> MeshResult<()> {
        self.store.install_master_key(key)
    }

    /// The replica for a collection, created on first use.
    ///
    /// Idempotent and thread-safe: concurrent callers observe the same
    /// replica instance.
    pub async fn collection(&self, name: &str) -> Arc<CollectionReplica> {
        let mut collections = self.collections.lock().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| {
                CollectionReplica::create(name, self.store.clone(), self.network.clone())
            })
            .clone()
    }

    /// Register a network configuration and dial its bootstrap peers.
    pub async fn create_network(&self, config: NetworkConfig) -> MeshResult<()> {
        self.network.create_network(config).await
    }

    /// Join an existing network.
    pub async fn join_network(&self, config: NetworkConfig) -> MeshResult<()> {
        self.network.join_network(config).await
    }

    /// Leave a network, detaching any collections attached to it.
    pub async fn leave_network(&self, network_id: &str) -> MeshResult<()> {
        let replicas: Vec<Arc<CollectionReplica>> = {
            let collections = self.collections.lock().await;
            collections.values().cloned().collect()
        };
        for replica in replicas {
            if replica.attached_network().await.as_deref() == Some(network_id) {
                replica.detach().await?;
            }
        }
        self.network.leave_network(network_id).await
    }

    /// Per-network transfer statistics.
    pub fn network_stats(&self, network_id: &str) -> NetworkStats {
        self.network.stats(network_id)
    }

    /// Inject the posting client for a collection's staged documents.
    pub async fn set_graph_client(&self, collection: &str, client: Arc<dyn GraphClient>) {
        self.collection(collection).await.set_graph_client(client).await;
    }

    /// Aggregate node statistics.
    pub async fn stats(&self) -> MeshResult<DatabaseStats> {
        let names: Vec<String> = {
            let collections = self.collections.lock().await;
            collections.keys().cloned().collect()
        };
        let mut documents_per_collection = HashMap::new();
        for name in &names {
            documents_per_collection.insert(name.clone(), self.store.count(name).await?);
        }
        Ok(DatabaseStats {
            collections: names.len(),
            documents_per_collection,
            networks: self.network.network_ids().len(),
        })
    }

    /// Parse and execute one command-language statement.
    pub async fn execute(&self, input: &str) -> MeshResult<ExecutionResult> {
        self.run(query::parse(input)?).await
    }

    /// Execute an already-parsed command.
    pub async fn run(&self, command: Command) -> MeshResult<ExecutionResult> {
        match command {
            Command::Get {
                entry_type,
                collection,
                filters,
                similar_to,
                limit,
            } => {
                let docs = self
                    .executor
                    .get(&entry_type, collection, filters, similar_to, limit)
                    .await?;
                Ok(ExecutionResult::Documents(docs))
            }
            Command::Set { key, value } => {
                let mut payload = serde_json::Map::new();
                payload.insert("value".to_string(), value);
                let doc = Document::new(key, EntryType::Auth, payload);
                self.collection("auth").await.insert(doc).await?;
                Ok(ExecutionResult::Ack)
            }
            Command::Delete { collection, id } => {
                let collection = collection.unwrap_or_else(|| "auth".to_string());
                self.collection(&collection).await.delete(&id).await?;
                Ok(ExecutionResult::Ack)
            }
            Command::CreateIndex {
                collection,
                name,
                fields,
                unique,
            } => {
                self.store
                    .create_index(IndexDefinition {
                        name,
                        collection,
                        kind: IndexKind::Exact,
                        fields,
                        unique,
                        partial: None,
                        dimensions: None,
                    })
                    .await?;
                Ok(ExecutionResult::Ack)
            }
            Command::CreateCollection { name } => {
                self.store.create_collection(&name).await?;
                self.collection(&name).await;
                Ok(ExecutionResult::Ack)
            }
            Command::DropIndex { collection, name } => {
                self.store.drop_index(&collection, &name).await?;
                Ok(ExecutionResult::Ack)
            }
            Command::DropCollection { name } => {
                self.store.drop_collection(&name).await?;
                self.collections.lock().await.remove(&name);
                Ok(ExecutionResult::Ack)
            }
        }
    }

    /// Create a typed secondary index directly.
    pub async fn create_index(&self, definition: IndexDefinition) -> MeshResult<()> {
        self.store.create_index(definition).await
    }

    /// Plan-and-run a GET programmatically.
    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Stop the network manager. In-flight handlers finish; no forced
    /// termination.
    pub async fn shutdown(&self) {
        self.network.shutdown().await;
        info!(peer_id = %self.network.peer_id(), "database shut down");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("peer_id", &self.network.peer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collection_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path()).await.unwrap();
        let a = db.collection("users").await;
        let b = db.collection("users").await;
        assert!(Arc::ptr_eq(&a, &b));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path()).await.unwrap();

        db.execute("SET api_key = 'secret'").await.unwrap();
        let result = db
            .execute("GET AUTH WHERE id = 'api_key'")
            .await
            .unwrap();
        match result {
            ExecutionResult::Documents(docs) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0].payload["value"], json!("secret"));
            }
            other => panic!("expected documents, got {other:?}"),
        }

        db.execute("DELETE WHERE id = 'api_key'").await.unwrap();
        match db.execute("GET AUTH WHERE id = 'api_key'").await.unwrap() {
            ExecutionResult::Documents(docs) => assert!(docs.is_empty()),
            other => panic!("expected documents, got {other:?}"),
        }
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_ddl_round_trip() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path()).await.unwrap();

        db.execute("CREATE COLLECTION notes").await.unwrap();
        db.execute("CREATE INDEX notes:topic ON notes (topic)")
            .await
            .unwrap();
        assert_eq!(db.store().indexes().definitions("notes").len(), 1);

        // Duplicate index name is rejected.
        let err = db
            .execute("CREATE INDEX notes:topic ON notes (topic)")
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::AlreadyExists { .. }));

        db.execute("DROP INDEX notes:topic").await.unwrap();
        assert!(db.store().indexes().definitions("notes").is_empty());
        db.execute("DROP COLLECTION notes").await.unwrap();
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path()).await.unwrap();
        db.collection("users")
            .await
            .insert(Document::new("u1", EntryType::Auth, serde_json::Map::new()))
            .await
            .unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.documents_per_collection["users"], 1);
        db.shutdown().await;
    }
}
