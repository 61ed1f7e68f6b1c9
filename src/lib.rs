//! # meshdb — local-first replicated document store
//!
//! meshdb keeps a full local replica of named collections of JSON-like
//! documents on disk, and reconciles concurrent edits with peers over a
//! peer-to-peer transport using vector-clock CRDTs with last-writer-wins
//! tie-breaking. A small query language exposes key/value retrieval,
//! filtered scans, and vector-similarity search; secondary indexes and a
//! cost-based planner accelerate the scans.
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshdb::{Database, Document, EntryType};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("./data").await?;
//!
//!     // Store a document
//!     let users = db.collection("users").await;
//!     users.insert(Document::new(
//!         "alice",
//!         EntryType::Auth,
//!         serde_json::from_value(json!({"name": "Alice"}))?,
//!     )).await?;
//!
//!     // Query it back
//!     let result = db.execute("GET AUTH FROM users WHERE name = 'Alice'").await?;
//!     println!("{result:?}");
//!
//!     // Replicate with peers
//!     db.create_network(meshdb::NetworkConfig::new("team", "Team Mesh")).await?;
//!     users.attach("team").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Database facade** (`db`) — collection and network lifecycle
//! 2. **Collection replica** (`replica`) — op log, sync, staged posting
//! 3. **CRDT resolver** (`crdt`) — conflict resolution over vector clocks
//! 4. **Document store** (`store`) — durable files, blob sidecars, envelope
//!    encryption for sensitive collections
//! 5. **Index manager + planner** (`index`, `planner`) — exact, inverted,
//!    and ANN indexes behind a cost-based plan
//! 6. **Network manager** (`network`) — TCP transport and typed dispatch
//!
//! ## Consistency model
//!
//! Eventual consistency only. Convergence is guaranteed when every
//! operation reaches every replica at least once; no linearizability,
//! cross-node transactions, or authenticated transport.

// Core data model
mod error;
mod types;

// Replication core
pub mod crdt;
pub mod replica;

// Storage
pub mod crypto;
pub mod store;

// Query engine
pub mod index;
pub mod planner;
pub mod query;

// Networking
pub mod network;

// Facade
pub mod db;

// Public API exports
pub use db::{Database, DatabaseStats, ExecutionResult};
pub use error::{MeshError, MeshResult};
pub use types::{
    ClockOrdering, CrdtOperation, DistributedDocument, Document, EntryType, OperationKind,
    VectorClock,
};

// Storage exports
pub use crypto::MasterKey;
pub use store::DocumentStore;

// Index and planner exports
pub use index::{IndexDefinition, IndexKind, IndexQuery, PartialPredicate};
pub use planner::{CollectionStats, IndexStats, QueryPlan, ScanType};

// Query exports
pub use query::{Command, CompareOp, Condition, QueryExecutor};

// Replication exports
pub use replica::{CollectionReplica, GraphClient, PostTransaction, SyncState};

// Network exports
pub use network::{
    MessageType, NetworkConfig, NetworkManager, NetworkStats, PeerInfo, ProtocolMessage,
};

// Re-export commonly used external types for convenience
pub use serde_json::{json, Value as JsonValue};

/// Initialize the logging system.
///
/// Call once at application startup; configures the tracing subscriber
/// with an environment filter. The log level is controlled through the
/// `MESH_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MESH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
