//! Secondary indexes: exact, inverted, and approximate-nearest-neighbor.
//!
//! Each collection owns a set of named indexes. Index metadata is persisted
//! under `<base>/<collection>/indexes/<name>/metadata.json` at create time
//! and re-scanned at process start; bodies are rebuilt from the document
//! set. An optional partial predicate (`field = literal`) gates inclusion
//! at insert time.

mod ann;
mod exact;
mod inverted;

pub use ann::{AnnIndex, DEFAULT_DIMENSIONS, DEFAULT_LIMIT, VECTOR_FIELD};
pub(crate) use ann::{cosine_similarity, extract_vector};
pub use exact::ExactIndex;
pub use inverted::InvertedIndex;

use crate::error::{MeshError, MeshResult};
use crate::types::Document;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Kind of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// B-tree-style exact match over a composite key.
    Exact,
    /// Tokenized text with posting lists.
    Inverted,
    /// Approximate nearest neighbor over a fixed-dimension vector.
    Ann,
}

/// Partial-index predicate: the document is indexed only when
/// `payload[field] == literal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialPredicate {
    pub field: String,
    pub literal: JsonValue,
}

impl PartialPredicate {
    fn matches(&self, doc: &Document) -> bool {
        doc.payload.get(&self.field) == Some(&self.literal)
    }
}

/// Persistent definition of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Name, unique within the collection.
    pub name: String,
    /// Owning collection.
    pub collection: String,
    /// Index kind.
    pub kind: IndexKind,
    /// The payload fields the index keys on.
    pub fields: Vec<String>,
    /// Uniqueness constraint (exact indexes only).
    #[serde(default)]
    pub unique: bool,
    /// Optional partial-index predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialPredicate>,
    /// Vector dimensionality (ANN indexes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

/// Parameters of an index lookup.
#[derive(Debug, Clone)]
pub enum IndexQuery {
    /// Exact lookup by literal key values, one per keyed field.
    Exact(Vec<JsonValue>),
    /// Posting-list lookup by token.
    Token(String),
    /// Nearest-neighbor search.
    Nearest {
        vector: Vec<f32>,
        limit: Option<usize>,
    },
}

#[derive(Debug)]
enum IndexBody {
    Exact(ExactIndex),
    Inverted(InvertedIndex),
    Ann(AnnIndex),
}

/// A single live index: definition plus in-memory body.
#[derive(Debug)]
pub struct Index {
    definition: IndexDefinition,
    body: RwLock<IndexBody>,
}

impl Index {
    fn new(definition: IndexDefinition) -> Self {
        let body = match definition.kind {
            IndexKind::Exact => IndexBody::Exact(ExactIndex::new()),
            IndexKind::Inverted => IndexBody::Inverted(InvertedIndex::new()),
            IndexKind::Ann => IndexBody::Ann(AnnIndex::new(definition.dimensions)),
        };
        Self {
            definition,
            body: RwLock::new(body),
        }
    }

    /// The persistent definition.
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Index a document. Documents failing the partial predicate are skipped.
    pub async fn insert(&self, doc: &Document) {
        if let Some(partial) = &self.definition.partial {
            if !partial.matches(doc) {
                return;
            }
        }
        let mut body = self.body.write().await;
        match &mut *body {
            IndexBody::Exact(exact) => {
                if let Some(key) = ExactIndex::composite_key(&self.definition.fields, &doc.payload)
                {
                    if !exact.insert(key, &doc.id, self.definition.unique) {
                        debug!(
                            index = %self.definition.name,
                            id = %doc.id,
                            "unique constraint: insert skipped"
                        );
                    }
                }
            }
            IndexBody::Inverted(inverted) => {
                let tokens = InvertedIndex::tokens_for(&self.definition.fields, &doc.payload);
                inverted.insert(tokens, &doc.id);
            }
            IndexBody::Ann(index) => {
                if let Some(vector) = ann::extract_vector(&doc.payload) {
                    index.insert(&doc.id, vector);
                }
            }
        }
    }

    /// Remove a document id from the index.
    pub async fn remove(&self, id: &str) {
        let mut body = self.body.write().await;
        match &mut *body {
            IndexBody::Exact(exact) => exact.remove(id),
            IndexBody::Inverted(inverted) => inverted.remove(id),
            IndexBody::Ann(index) => index.remove(id),
        }
    }

    /// Run a lookup, returning matching document ids.
    pub async fn query(&self, query: &IndexQuery) -> Vec<String> {
        let body = self.body.read().await;
        match (&*body, query) {
            (IndexBody::Exact(exact), IndexQuery::Exact(values)) => exact.lookup(values),
            (IndexBody::Inverted(inverted), IndexQuery::Token(token)) => inverted.lookup(token),
            (IndexBody::Ann(index), IndexQuery::Nearest { vector, limit }) => index
                .search(vector, *limit)
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Number of distinct keys (exact/inverted) or stored vectors (ANN).
    pub async fn cardinality(&self) -> usize {
        let body = self.body.read().await;
        match &*body {
            IndexBody::Exact(exact) => exact.cardinality(),
            IndexBody::Inverted(inverted) => inverted.cardinality(),
            IndexBody::Ann(index) => index.len(),
        }
    }
}

/// Manages the index sets of every collection under one base directory.
pub struct IndexManager {
    base_dir: PathBuf,
    /// collection -> live indexes
    collections: DashMap<String, Vec<Arc<Index>>>,
}

impl IndexManager {
    /// Create a manager with no indexes loaded.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            collections: DashMap::new(),
        }
    }

    /// Scan the base directory for persisted index metadata.
    ///
    /// Bodies are left empty; the caller rebuilds them from the document
    /// set (see `DocumentStore::open`).
    pub async fn open(base_dir: impl Into<PathBuf>) -> MeshResult<Self> {
        let manager = Self::new(base_dir);
        if !manager.base_dir.exists() {
            return Ok(manager);
        }

        let mut collections = fs::read_dir(&manager.base_dir).await?;
        while let Some(collection_entry) = collections.next_entry().await? {
            if !collection_entry.file_type().await?.is_dir() {
                continue;
            }
            let indexes_dir = collection_entry.path().join("indexes");
            if !indexes_dir.exists() {
                continue;
            }
            let mut indexes = fs::read_dir(&indexes_dir).await?;
            while let Some(index_entry) = indexes.next_entry().await? {
                let metadata_path = index_entry.path().join("metadata.json");
                if !metadata_path.exists() {
                    continue;
                }
                let bytes = fs::read(&metadata_path).await?;
                match serde_json::from_slice::<IndexDefinition>(&bytes) {
                    Ok(definition) => {
                        manager
                            .collections
                            .entry(definition.collection.clone())
                            .or_default()
                            .push(Arc::new(Index::new(definition)));
                    }
                    Err(e) => {
                        warn!(path = %metadata_path.display(), error = %e, "skipping unreadable index metadata");
                    }
                }
            }
        }
        Ok(manager)
    }

    fn index_dir(&self, collection: &str, name: &str) -> PathBuf {
        self.base_dir.join(collection).join("indexes").join(name)
    }

    /// Create an index and persist its metadata.
    pub async fn create(&self, definition: IndexDefinition) -> MeshResult<Arc<Index>> {
        {
            let existing = self.collections.get(&definition.collection);
            if let Some(indexes) = existing {
                if indexes.iter().any(|i| i.definition.name == definition.name) {
                    return Err(MeshError::AlreadyExists {
                        collection: definition.collection.clone(),
                        name: definition.name.clone(),
                    });
                }
            }
        }

        let dir = self.index_dir(&definition.collection, &definition.name);
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join("metadata.json"), &serde_json::to_vec_pretty(&definition)?).await?;

        let index = Arc::new(Index::new(definition.clone()));
        self.collections
            .entry(definition.collection)
            .or_default()
            .push(index.clone());
        Ok(index)
    }

    /// Drop an index and its on-disk directory.
    pub async fn drop(&self, collection: &str, name: &str) -> MeshResult<()> {
        let removed = match self.collections.get_mut(collection) {
            Some(mut indexes) => {
                let before = indexes.len();
                indexes.retain(|i| i.definition.name != name);
                indexes.len() != before
            }
            None => false,
        };
        if !removed {
            return Err(MeshError::NotFound {
                collection: collection.to_string(),
                key: name.to_string(),
            });
        }

        let dir = self.index_dir(collection, name);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Index a document into every index of its collection.
    pub async fn insert_document(&self, collection: &str, doc: &Document) {
        let indexes = self.indexes(collection);
        for index in indexes {
            index.insert(doc).await;
        }
    }

    /// Remove a document id from every index of its collection.
    pub async fn remove_document(&self, collection: &str, id: &str) {
        let indexes = self.indexes(collection);
        for index in indexes {
            index.remove(id).await;
        }
    }

    /// Look up a named index.
    pub fn get(&self, collection: &str, name: &str) -> Option<Arc<Index>> {
        self.collections
            .get(collection)?
            .iter()
            .find(|i| i.definition.name == name)
            .cloned()
    }

    /// Run a lookup against a named index.
    pub async fn query(
        &self,
        collection: &str,
        name: &str,
        query: &IndexQuery,
    ) -> MeshResult<Vec<String>> {
        let index = self.get(collection, name).ok_or_else(|| MeshError::NotFound {
            collection: collection.to_string(),
            key: name.to_string(),
        })?;
        Ok(index.query(query).await)
    }

    /// Definitions of every index on a collection.
    pub fn definitions(&self, collection: &str) -> Vec<IndexDefinition> {
        self.collections
            .get(collection)
            .map(|indexes| indexes.iter().map(|i| i.definition.clone()).collect())
            .unwrap_or_default()
    }

    /// Live indexes of a collection.
    pub fn indexes(&self, collection: &str) -> Vec<Arc<Index>> {
        self.collections
            .get(collection)
            .map(|indexes| indexes.clone())
            .unwrap_or_default()
    }

    /// Collections that currently have at least one index.
    pub fn indexed_collections(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }
}

/// Write bytes atomically: temp file then rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> MeshResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryType;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(id: &str, fields: &[(&str, JsonValue)]) -> Document {
        let payload = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new(id, EntryType::Auth, payload)
    }

    fn exact_def(collection: &str, name: &str, field: &str, unique: bool) -> IndexDefinition {
        IndexDefinition {
            name: name.to_string(),
            collection: collection.to_string(),
            kind: IndexKind::Exact,
            fields: vec![field.to_string()],
            unique,
            partial: None,
            dimensions: None,
        }
    }

    #[tokio::test]
    async fn test_create_persists_metadata() {
        let temp = TempDir::new().unwrap();
        let manager = IndexManager::new(temp.path());
        manager
            .create(exact_def("users", "username", "username", true))
            .await
            .unwrap();

        let metadata_path = temp
            .path()
            .join("users")
            .join("indexes")
            .join("username")
            .join("metadata.json");
        assert!(metadata_path.exists());

        let err = manager
            .create(exact_def("users", "username", "username", true))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_open_rescans_metadata() {
        let temp = TempDir::new().unwrap();
        {
            let manager = IndexManager::new(temp.path());
            manager
                .create(exact_def("users", "email", "email", false))
                .await
                .unwrap();
        }

        let reopened = IndexManager::open(temp.path()).await.unwrap();
        let defs = reopened.definitions("users");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "email");
    }

    #[tokio::test]
    async fn test_insert_query_remove() {
        let temp = TempDir::new().unwrap();
        let manager = IndexManager::new(temp.path());
        manager
            .create(exact_def("users", "username", "username", false))
            .await
            .unwrap();

        manager
            .insert_document("users", &doc("u1", &[("username", json!("alice"))]))
            .await;
        manager
            .insert_document("users", &doc("u2", &[("username", json!("bob"))]))
            .await;

        let hits = manager
            .query("users", "username", &IndexQuery::Exact(vec![json!("alice")]))
            .await
            .unwrap();
        assert_eq!(hits, vec!["u1".to_string()]);

        manager.remove_document("users", "u1").await;
        let hits = manager
            .query("users", "username", &IndexQuery::Exact(vec![json!("alice")]))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_partial_predicate_gates_inclusion() {
        let temp = TempDir::new().unwrap();
        let manager = IndexManager::new(temp.path());
        let mut def = exact_def("events", "errors", "code", false);
        def.partial = Some(PartialPredicate {
            field: "classification".to_string(),
            literal: json!("ERROR"),
        });
        manager.create(def).await.unwrap();

        manager
            .insert_document(
                "events",
                &doc("e1", &[("code", json!("E1")), ("classification", json!("ERROR"))]),
            )
            .await;
        manager
            .insert_document(
                "events",
                &doc("e2", &[("code", json!("E1")), ("classification", json!("INFO"))]),
            )
            .await;

        let hits = manager
            .query("events", "errors", &IndexQuery::Exact(vec![json!("E1")]))
            .await
            .unwrap();
        assert_eq!(hits, vec!["e1".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let temp = TempDir::new().unwrap();
        let manager = IndexManager::new(temp.path());
        manager
            .create(exact_def("users", "username", "username", false))
            .await
            .unwrap();
        manager.drop("users", "username").await.unwrap();

        assert!(!temp.path().join("users").join("indexes").join("username").exists());
        let err = manager.drop("users", "username").await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { .. }));
    }
}
