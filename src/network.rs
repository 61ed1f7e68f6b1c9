/// Peer-to-peer transport and message dispatch.
///
/// Every node generates a random hex peer id at startup and binds one TCP
/// listener on an ephemeral port. Connections carry newline-delimited JSON:
/// a single greeting line with the sender's peer id, then one
/// [`ProtocolMessage`] per line. Handlers are registered per message type
/// and run on the connection's read task, so a blocking handler blocks
/// further message processing for that connection — keep handlers short and
/// offload real work.
///
/// There is no authentication and no transport encryption here; this seam
/// is a deliberate boundary contract, and an authenticated secure transport
/// can replace it without touching the replica logic.
use crate::error::{MeshError, MeshResult};
use crate::types::{CrdtOperation, VectorClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Maximum accepted line length (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Generate a random hex peer id.
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Replication strategy of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStrategy {
    Full,
    Partial,
    Leader,
}

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub factor: u32,
    pub strategy: ReplicationStrategy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 2,
            strategy: ReplicationStrategy::Full,
        }
    }
}

/// Peer discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub mdns: bool,
    pub bootstrap: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns: false,
            bootstrap: true,
        }
    }
}

/// Payload encryption settings (boundary contract; not applied by the
/// transport itself).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

/// Configuration of a named replication group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: String,
    pub name: String,
    /// Collections replicated in this network.
    #[serde(default)]
    pub collections: HashSet<String>,
    /// Addresses dialed at join time.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Network that staged documents are posted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_posting_network: Option<String>,
    /// Entry classifications that are automatically staged for posting.
    #[serde(default)]
    pub auto_post_classifications: HashSet<String>,
    /// When set, documents are never broadcast as CRDT ops; only staged
    /// documents leave the node, out of band.
    #[serde(default = "default_private")]
    pub private_by_default: bool,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

fn default_private() -> bool {
    true
}

impl NetworkConfig {
    /// A config with the given id/name and all defaults.
    pub fn new(network_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            name: name.into(),
            collections: HashSet::new(),
            bootstrap_peers: Vec::new(),
            default_posting_network: None,
            auto_post_classifications: HashSet::new(),
            private_by_default: true,
            replication: ReplicationConfig::default(),
            discovery: DiscoveryConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// The six wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SyncRequest,
    SyncResponse,
    Operation,
    Heartbeat,
    CollectionAnnounce,
    CollectionRequest,
}

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "networkId")]
    pub network_id: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub payload: JsonValue,
}

impl ProtocolMessage {
    pub fn new(
        message_type: MessageType,
        network_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_type,
            network_id: network_id.into(),
            sender_id: sender_id.into(),
            timestamp: crate::crdt::now_ms(),
            payload,
        }
    }
}

/// Payload of an `operation` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPayload {
    pub collection: String,
    pub operation: CrdtOperation,
}

/// Payload of a `sync_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub collection: String,
    pub vector: VectorClock,
}

/// Payload of a `sync_response` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub collection: String,
    pub operations: Vec<CrdtOperation>,
    pub vector: VectorClock,
}

/// Payload of `collection_announce` and `collection_request` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionPayload {
    pub collection: String,
}

/// Greeting line exchanged once per connection.
#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    #[serde(rename = "peerId")]
    peer_id: String,
}

/// Information about a connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub address: SocketAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    fn new(peer_id: String, address: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            address,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Per-network transfer counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub operations_sent: u64,
    pub operations_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected_peers: usize,
}

/// An async message handler. Handlers run on the connection's read task.
pub type MessageHandler = Arc<dyn Fn(ProtocolMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct PeerConnection {
    info: PeerInfo,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

struct NetworkInner {
    peer_id: String,
    local_addr: RwLock<Option<SocketAddr>>,
    connections: DashMap<String, PeerConnection>,
    networks: DashMap<String, NetworkConfig>,
    /// network id -> peer ids seen in that network
    network_peers: DashMap<String, HashSet<String>>,
    /// collection name -> network id
    collections: DashMap<String, String>,
    handlers: DashMap<MessageType, Vec<MessageHandler>>,
    stats: DashMap<String, NetworkStats>,
    shutdown: broadcast::Sender<()>,
}

/// Manages peer connections, framed transport, and typed dispatch.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<NetworkInner>,
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager {
    /// Create a manager with a freshly generated peer id.
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(NetworkInner {
                peer_id: generate_peer_id(),
                local_addr: RwLock::new(None),
                connections: DashMap::new(),
                networks: DashMap::new(),
                network_peers: DashMap::new(),
                collections: DashMap::new(),
                handlers: DashMap::new(),
                stats: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// The listener address once `start` has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().await
    }

    /// Bind the listener on an ephemeral port and start accepting peers.
    pub async fn start(&self) -> MeshResult<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.write().await = Some(addr);
        info!(peer_id = %self.inner.peer_id, %addr, "listening");

        let manager = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                if let Err(e) = manager.establish(stream, peer_addr, false, None).await {
                                    warn!(%peer_addr, error = %e, "inbound handshake failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Register a handler for a message type. All handlers registered for a
    /// type are invoked, in registration order, for each inbound message.
    pub fn on(&self, message_type: MessageType, handler: MessageHandler) {
        self.inner
            .handlers
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    /// Register a network configuration and dial its bootstrap peers.
    pub async fn create_network(&self, config: NetworkConfig) -> MeshResult<()> {
        let network_id = config.network_id.clone();
        let bootstrap = config.bootstrap_peers.clone();
        self.inner.networks.insert(network_id.clone(), config);
        self.inner.stats.entry(network_id.clone()).or_default();

        for addr in bootstrap {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    if let Err(e) = self.connect_peer(addr, &network_id).await {
                        warn!(%addr, error = %e, "bootstrap dial failed");
                    }
                }
                Err(e) => warn!(%addr, error = %e, "bad bootstrap address"),
            }
        }
        Ok(())
    }

    /// Join an existing network: register it, dial bootstrap peers, and ask
    /// them what collections they replicate.
    pub async fn join_network(&self, config: NetworkConfig) -> MeshResult<()> {
        let network_id = config.network_id.clone();
        let collections = config.collections.clone();
        self.create_network(config).await?;
        for collection in collections {
            let message = ProtocolMessage::new(
                MessageType::CollectionRequest,
                network_id.clone(),
                self.inner.peer_id.clone(),
                serde_json::to_value(CollectionPayload { collection })?,
            );
            self.broadcast(&network_id, &message).await?;
        }
        Ok(())
    }

    /// Forget a network. Connections shared with other networks stay up.
    pub async fn leave_network(&self, network_id: &str) -> MeshResult<()> {
        self.inner.networks.remove(network_id);
        self.inner.network_peers.remove(network_id);
        self.inner.stats.remove(network_id);
        self.inner
            .collections
            .retain(|_, attached| attached != network_id);
        Ok(())
    }

    /// The registered configuration of a network.
    pub fn network_config(&self, network_id: &str) -> Option<NetworkConfig> {
        self.inner.networks.get(network_id).map(|c| c.clone())
    }

    /// Register a collection as replicated in a network.
    pub fn register_collection(&self, collection: &str, network_id: &str) -> MeshResult<()> {
        if !self.inner.networks.contains_key(network_id) {
            return Err(MeshError::NotFound {
                collection: collection.to_string(),
                key: network_id.to_string(),
            });
        }
        self.inner
            .collections
            .insert(collection.to_string(), network_id.to_string());
        Ok(())
    }

    /// Remove a collection registration.
    pub fn unregister_collection(&self, collection: &str) {
        self.inner.collections.remove(collection);
    }

    /// The network a collection is registered with.
    pub fn collection_network(&self, collection: &str) -> Option<String> {
        self.inner.collections.get(collection).map(|n| n.clone())
    }

    /// Dial a peer and associate the connection with a network.
    ///
    /// Returns the remote peer id.
    pub async fn connect_peer(&self, addr: SocketAddr, network_id: &str) -> MeshResult<String> {
        let stream = TcpStream::connect(addr).await?;
        self.establish(stream, addr, true, Some(network_id.to_string()))
            .await
    }

    async fn establish(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        initiate: bool,
        network_id: Option<String>,
    ) -> MeshResult<String> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let greeting = serde_json::to_string(&Greeting {
            peer_id: self.inner.peer_id.clone(),
        })?;

        let remote = if initiate {
            send_line(&mut write_half, &greeting).await?;
            read_greeting(&mut reader).await?
        } else {
            let remote = read_greeting(&mut reader).await?;
            send_line(&mut write_half, &greeting).await?;
            remote
        };

        debug!(peer_id = %remote, %peer_addr, initiate, "peer connected");

        self.inner.connections.insert(
            remote.clone(),
            PeerConnection {
                info: PeerInfo::new(remote.clone(), peer_addr),
                writer: Arc::new(Mutex::new(write_half)),
            },
        );
        if let Some(network_id) = network_id {
            self.inner
                .network_peers
                .entry(network_id)
                .or_default()
                .insert(remote.clone());
        }

        let manager = self.clone();
        let reader_peer = remote.clone();
        tokio::spawn(async move {
            manager.read_loop(reader, reader_peer).await;
        });

        Ok(remote)
    }

    async fn read_loop(&self, reader: BufReader<OwnedReadHalf>, peer_id: String) {
        let mut lines = reader.lines();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.process_line(&peer_id, line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "read failed");
                        break;
                    }
                }
            }
        }

        debug!(peer_id = %peer_id, "peer disconnected");
        self.inner.connections.remove(&peer_id);
        for mut peers in self.inner.network_peers.iter_mut() {
            peers.remove(&peer_id);
        }
    }

    /// Decode one inbound line, update bookkeeping, and dispatch handlers.
    ///
    /// Malformed peer input is logged and swallowed; it must not take down
    /// the replica.
    async fn process_line(&self, peer_id: &str, line: String) {
        if line.len() > MAX_MESSAGE_SIZE {
            warn!(peer_id = %peer_id, len = line.len(), "oversized message dropped");
            return;
        }
        let message: ProtocolMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "undecodable message dropped");
                return;
            }
        };
        if message.sender_id == self.inner.peer_id {
            return;
        }

        {
            let mut stats = self.inner.stats.entry(message.network_id.clone()).or_default();
            stats.bytes_received += line.len() as u64;
            if message.message_type == MessageType::Operation {
                stats.operations_received += 1;
            }
        }
        self.inner
            .network_peers
            .entry(message.network_id.clone())
            .or_default()
            .insert(message.sender_id.clone());
        if let Some(mut connection) = self.inner.connections.get_mut(peer_id) {
            connection.info.last_seen = Utc::now();
        }

        let handlers: Vec<MessageHandler> = self
            .inner
            .handlers
            .get(&message.message_type)
            .map(|h| h.clone())
            .unwrap_or_default();
        for handler in handlers {
            handler(message.clone()).await;
        }
    }

    /// Send a message to every currently connected peer of a network.
    ///
    /// Returns the number of peers reached.
    pub async fn broadcast(&self, network_id: &str, message: &ProtocolMessage) -> MeshResult<usize> {
        let peers: Vec<String> = self
            .inner
            .network_peers
            .get(network_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let line = serde_json::to_string(message)?;
        let sends = peers.iter().filter_map(|peer| {
            let connection = self.inner.connections.get(peer)?;
            let writer = connection.writer.clone();
            let line = line.clone();
            Some(async move {
                let mut writer = writer.lock().await;
                send_line(&mut writer, &line).await
            })
        });

        let results = futures::future::join_all(sends).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();

        let mut stats = self.inner.stats.entry(network_id.to_string()).or_default();
        stats.bytes_sent += (line.len() as u64) * delivered as u64;
        if message.message_type == MessageType::Operation {
            stats.operations_sent += delivered as u64;
        }
        Ok(delivered)
    }

    /// Send a message to one peer; fails when no connection is established.
    pub async fn send_to_peer(&self, peer_id: &str, message: &ProtocolMessage) -> MeshResult<()> {
        let writer = self
            .inner
            .connections
            .get(peer_id)
            .map(|c| c.writer.clone())
            .ok_or_else(|| MeshError::PeerUnavailable {
                peer_id: peer_id.to_string(),
            })?;

        let line = serde_json::to_string(message)?;
        {
            let mut writer = writer.lock().await;
            send_line(&mut writer, &line).await?;
        }

        let mut stats = self
            .inner
            .stats
            .entry(message.network_id.clone())
            .or_default();
        stats.bytes_sent += line.len() as u64;
        if message.message_type == MessageType::Operation {
            stats.operations_sent += 1;
        }
        Ok(())
    }

    /// Connected peers of a network.
    pub fn network_peers(&self, network_id: &str) -> Vec<PeerInfo> {
        let Some(peers) = self.inner.network_peers.get(network_id) else {
            return Vec::new();
        };
        peers
            .iter()
            .filter_map(|peer| self.inner.connections.get(peer).map(|c| c.info.clone()))
            .collect()
    }

    /// Transfer counters for a network.
    pub fn stats(&self, network_id: &str) -> NetworkStats {
        let mut stats = self
            .inner
            .stats
            .get(network_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.connected_peers = self
            .inner
            .network_peers
            .get(network_id)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|peer| self.inner.connections.contains_key(peer.as_str()))
                    .count()
            })
            .unwrap_or(0);
        stats
    }

    /// Registered network ids.
    pub fn network_ids(&self) -> Vec<String> {
        self.inner.networks.iter().map(|e| e.key().clone()).collect()
    }

    /// Close the listener and all connections. In-flight handlers finish.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        self.inner.connections.clear();
        *self.inner.local_addr.write().await = None;
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> MeshResult<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_greeting(reader: &mut BufReader<OwnedReadHalf>) -> MeshResult<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(MeshError::invalid("connection closed before greeting"));
    }
    let greeting: Greeting = serde_json::from_str(line.trim())
        .map_err(|e| MeshError::invalid(format!("bad greeting: {e}")))?;
    Ok(greeting.peer_id)
}
