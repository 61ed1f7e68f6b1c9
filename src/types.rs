/// Common types used throughout meshdb.
///
/// This module defines the core data structures of the replication model:
/// vector clocks, the regular and distributed document forms, and the CRDT
/// operation record that travels between peers.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every component is equal.
    Equal,
    /// Every component is ≤ with at least one strictly less.
    Before,
    /// Every component is ≥ with at least one strictly greater.
    After,
    /// Some components less, some greater: the clocks conflict.
    Concurrent,
}

/// Vector clock for causal ordering across peers.
///
/// A vector clock is a finite mapping from peer id to a monotonic counter.
/// Absent peers read as zero. Each peer increments its own component on
/// every local write and merges in remote clocks on receipt of remote
/// operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    /// Peer id -> logical counter mapping
    pub clocks: HashMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Read the counter for a peer; absent peers read as zero.
    pub fn get(&self, peer_id: &str) -> u64 {
        self.clocks.get(peer_id).copied().unwrap_or(0)
    }

    /// Increment the counter for a peer, creating the entry as needed.
    pub fn increment(&mut self, peer_id: &str) {
        let entry = self.clocks.entry(peer_id.to_string()).or_insert(0);
        *entry += 1;
    }

    /// Componentwise maximum of two clocks, returned as a new clock.
    ///
    /// Neither input is mutated.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (peer_id, counter) in &other.clocks {
            let entry = merged.clocks.entry(peer_id.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
        merged
    }

    /// Compare two clocks componentwise over the union of their keys.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let all_peers: std::collections::HashSet<_> =
            self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut has_less = false;
        let mut has_greater = false;

        for peer_id in all_peers {
            let self_val = self.get(peer_id);
            let other_val = other.get(peer_id);

            match self_val.cmp(&other_val) {
                std::cmp::Ordering::Less => has_less = true,
                std::cmp::Ordering::Greater => has_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (has_less, has_greater) {
            (true, true) => ClockOrdering::Concurrent,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
        }
    }

    /// Check whether this clock is causally at-or-before another.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Before | ClockOrdering::Equal
        )
    }
}

/// Classification of a document within its collection.
///
/// The known set is `MEMORY` and `AUTH`; the set is extensible, so unknown
/// strings round-trip through [`EntryType::Other`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// A memory record; carries a blob sidecar when a `blob` field is present.
    Memory,
    /// An authentication/key-value record.
    Auth,
    /// Any other entry type string, preserved verbatim.
    Other(String),
}

impl EntryType {
    /// The wire string for this entry type.
    pub fn as_str(&self) -> &str {
        match self {
            EntryType::Memory => "MEMORY",
            EntryType::Auth => "AUTH",
            EntryType::Other(s) => s,
        }
    }

    /// The default collection name for this entry type (lowercased).
    pub fn default_collection(&self) -> String {
        self.as_str().to_lowercase()
    }
}

impl From<&str> for EntryType {
    fn from(s: &str) -> Self {
        match s {
            "MEMORY" => EntryType::Memory,
            "AUTH" => EntryType::Auth,
            other => EntryType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EntryType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntryType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EntryType::from(s.as_str()))
    }
}

/// A document in its regular (local) form: plain payload plus identity.
///
/// On disk and in the public API the payload fields sit directly next to
/// `id` and `entryType` in one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique id within the collection.
    pub id: String,
    /// Entry type classification.
    #[serde(rename = "entryType")]
    pub entry_type: EntryType,
    /// All remaining payload fields, flattened on the wire.
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

impl Document {
    /// Create a document from an id, entry type and payload map.
    pub fn new(id: impl Into<String>, entry_type: EntryType, payload: Map<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            entry_type,
            payload,
        }
    }
}

/// A document in its distributed form: payload plus CRDT metadata.
///
/// This is the shape carried over the wire and in the operation log. The
/// metadata fields use the underscore-prefixed wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedDocument {
    /// Unique id within the collection.
    pub id: String,
    /// Entry type classification.
    #[serde(rename = "entryType")]
    pub entry_type: EntryType,
    /// The vector clock at which this version was produced.
    #[serde(rename = "_vector")]
    pub vector: VectorClock,
    /// Millisecond wall-clock tiebreak.
    #[serde(rename = "_timestamp")]
    pub timestamp: i64,
    /// Origin peer of this version.
    #[serde(rename = "_peerId")]
    pub peer_id: String,
    /// Tombstone flag.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
    /// Staged-posting marker (`"post-pending"` while awaiting submission).
    #[serde(rename = "_stage", default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// All remaining payload fields, flattened on the wire.
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

/// Kind of a CRDT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a document.
    Insert,
    /// Merge fields into an existing document.
    Update,
    /// Tombstone a document.
    Delete,
}

/// A durable record of a local mutation, used for replication.
///
/// Operations are idempotent under replay when applied through the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtOperation {
    /// Unique operation id (UUIDv4).
    pub op_id: String,
    /// What the operation does.
    pub kind: OperationKind,
    /// Collection the operation targets.
    pub collection: String,
    /// Document the operation targets.
    pub document_id: String,
    /// The distributed document body; absent for Delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DistributedDocument>,
    /// The producing peer's clock after the local increment.
    pub vector: VectorClock,
    /// Millisecond wall-clock at production time.
    pub timestamp: i64,
    /// The producing peer.
    pub peer_id: String,
}
