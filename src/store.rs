/// Durable document storage.
///
/// One file per document, JSON-encoded, grouped by collection:
///
/// ```text
/// <base>/<collection>/<id>.json           document file
/// <base>/<collection>/blobs/<id>          raw blob sidecar (MEMORY only)
/// <base>/<collection>/indexes/<name>/…    index metadata and bodies
/// ```
///
/// Writes are atomic (temp file + rename) and all I/O is async. A
/// readers-writer lock protects each store instance; per-document reads
/// proceed concurrently under the read half.
///
/// Two transformations sit on the write path: MEMORY documents carrying an
/// inlined `blob` have it moved to a sidecar file and replaced with a
/// `blobRef` path, and documents in sensitive collections have their
/// declared fields envelope-encrypted when a master key is installed. Both
/// are undone on the read path, so callers always see their own view.
/// Secondary indexes are refreshed from that caller view, never from the
/// encrypted or sidecar form.
use crate::crypto::{self, MasterKey};
use crate::error::{MeshError, MeshResult};
use crate::index::{write_atomic, IndexDefinition, IndexManager};
use crate::types::{Document, EntryType};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Marker suffix for per-field encryption flags.
const ENCRYPTED_SUFFIX: &str = "_encrypted";

/// Durable, optionally encrypting document store.
pub struct DocumentStore {
    base_dir: PathBuf,
    master_key: OnceLock<MasterKey>,
    indexes: IndexManager,
    lock: RwLock<()>,
}

impl DocumentStore {
    /// Open a store rooted at `base_dir`, re-scanning persisted index
    /// metadata and rebuilding index bodies from the document set.
    pub async fn open(base_dir: impl Into<PathBuf>) -> MeshResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        let indexes = IndexManager::open(&base_dir).await?;

        let store = Self {
            base_dir,
            master_key: OnceLock::new(),
            indexes,
            lock: RwLock::new(()),
        };

        for collection in store.indexes.indexed_collections() {
            let docs = store.find_all(&collection).await?;
            for doc in &docs {
                store.indexes.insert_document(&collection, doc).await;
            }
            debug!(collection = %collection, documents = docs.len(), "rebuilt indexes");
        }

        Ok(store)
    }

    /// Install the process-wide master key.
    ///
    /// Expected to happen before the first sensitive read or write.
    /// Installing a second key is an error.
    pub fn install_master_key(&self, key: MasterKey) -> MeshResult<()> {
        self.master_key
            .set(key)
            .map_err(|_| MeshError::crypto("master key already installed"))
    }

    /// The installed master key, if any.
    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.get()
    }

    /// The secondary-index manager for this store.
    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// The base data directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.base_dir.join(collection)
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{id}.json"))
    }

    fn blob_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join("blobs").join(id)
    }

    /// Insert (or overwrite) a document.
    pub async fn insert(&self, collection: &str, doc: Document) -> MeshResult<()> {
        let _guard = self.lock.write().await;
        self.insert_locked(collection, doc).await
    }

    async fn insert_locked(&self, collection: &str, doc: Document) -> MeshResult<()> {
        if doc.id.is_empty() {
            return Err(MeshError::invalid("document is missing an id"));
        }
        if doc.id.contains(['/', '\\']) || doc.id.starts_with('.') {
            return Err(MeshError::invalid(format!(
                "document id '{}' is not a valid file name",
                doc.id
            )));
        }

        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir).await?;

        // The index view is the caller's view: pre-sidecar, unencrypted.
        let logical = doc.clone();
        let mut stored = doc;

        if stored.entry_type == EntryType::Memory {
            if let Some(blob) = stored.payload.remove("blob") {
                let bytes = match blob {
                    JsonValue::String(s) => s.into_bytes(),
                    other => {
                        return Err(MeshError::invalid(format!(
                            "blob must be a string, got {}",
                            json_kind(&other)
                        )))
                    }
                };
                let blob_path = self.blob_path(collection, &stored.id);
                fs::create_dir_all(blob_path.parent().unwrap_or(Path::new("."))).await?;
                write_atomic(&blob_path, &bytes).await?;
                stored.payload.insert(
                    "blobRef".to_string(),
                    JsonValue::String(blob_path.to_string_lossy().into_owned()),
                );
            }
        }

        if let Some(fields) = crypto::sensitive_fields(collection) {
            if let Some(key) = self.master_key.get() {
                let mut any_encrypted = false;
                for field in fields {
                    if let Some(value) = stored.payload.get(*field).cloned() {
                        let sealed = crypto::encrypt_field(key, &value)?;
                        stored
                            .payload
                            .insert(field.to_string(), JsonValue::String(sealed));
                        stored
                            .payload
                            .insert(format!("{field}{ENCRYPTED_SUFFIX}"), JsonValue::Bool(true));
                        any_encrypted = true;
                    }
                }
                if any_encrypted {
                    stored
                        .payload
                        .insert("encrypted".to_string(), JsonValue::Bool(true));
                    stored.payload.insert(
                        "encryption_key_id".to_string(),
                        JsonValue::String(key.key_id().to_string()),
                    );
                }
            }
            // No master key: written in clear, read back unchanged.
        }

        let path = self.document_path(collection, &stored.id);
        write_atomic(&path, &serde_json::to_vec_pretty(&stored)?).await?;

        self.indexes.remove_document(collection, &logical.id).await;
        self.indexes.insert_document(collection, &logical).await;
        Ok(())
    }

    /// Fetch a document, or `NotFound`.
    pub async fn find(&self, collection: &str, id: &str) -> MeshResult<Document> {
        self.try_find(collection, id)
            .await?
            .ok_or_else(|| MeshError::NotFound {
                collection: collection.to_string(),
                key: id.to_string(),
            })
    }

    /// Fetch a document, or `None` when absent.
    pub async fn try_find(&self, collection: &str, id: &str) -> MeshResult<Option<Document>> {
        let _guard = self.lock.read().await;
        self.read_locked(collection, id).await
    }

    async fn read_locked(&self, collection: &str, id: &str) -> MeshResult<Option<Document>> {
        let path = self.document_path(collection, id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut doc: Document = serde_json::from_slice(&bytes)?;

        if doc.payload.get("encrypted") == Some(&JsonValue::Bool(true)) {
            if let Some(key) = self.master_key.get() {
                let marked: Vec<String> = doc
                    .payload
                    .keys()
                    .filter_map(|k| k.strip_suffix(ENCRYPTED_SUFFIX).map(|s| s.to_string()))
                    .filter(|field| doc.payload.get(&format!("{field}{ENCRYPTED_SUFFIX}")) == Some(&JsonValue::Bool(true)))
                    .collect();
                for field in marked {
                    let sealed = doc
                        .payload
                        .get(&field)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| MeshError::crypto(format!("field '{field}' marked encrypted but not a string")))?
                        .to_string();
                    let value = crypto::decrypt_field(key, &sealed)?;
                    doc.payload.insert(field.clone(), value);
                    doc.payload.remove(&format!("{field}{ENCRYPTED_SUFFIX}"));
                }
                doc.payload.remove("encrypted");
                doc.payload.remove("encryption_key_id");
            }
        }

        if doc.entry_type == EntryType::Memory {
            if let Some(blob_ref) = doc.payload.remove("blobRef") {
                let blob_path = blob_ref
                    .as_str()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.blob_path(collection, id));
                match fs::read(&blob_path).await {
                    Ok(bytes) => {
                        let text = String::from_utf8(bytes).map_err(|_| {
                            MeshError::invalid(format!("blob for '{id}' is not valid UTF-8"))
                        })?;
                        doc.payload.insert("blob".to_string(), JsonValue::String(text));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(collection = %collection, id = %id, "blob sidecar missing");
                        doc.payload.insert("blobRef".to_string(), blob_ref);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(Some(doc))
    }

    /// Read-modify-merge-write: overlay `changes` onto the current payload.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        changes: serde_json::Map<String, JsonValue>,
    ) -> MeshResult<Document> {
        let _guard = self.lock.write().await;
        let mut doc = self
            .read_locked(collection, id)
            .await?
            .ok_or_else(|| MeshError::NotFound {
                collection: collection.to_string(),
                key: id.to_string(),
            })?;
        for (field, value) in changes {
            doc.payload.insert(field, value);
        }
        let updated = doc.clone();
        self.insert_locked(collection, doc).await?;
        Ok(updated)
    }

    /// Remove a document, its blob sidecar, and its index entries.
    pub async fn delete(&self, collection: &str, id: &str) -> MeshResult<()> {
        let _guard = self.lock.write().await;
        let path = self.document_path(collection, id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MeshError::NotFound {
                    collection: collection.to_string(),
                    key: id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let blob_path = self.blob_path(collection, id);
        match fs::remove_file(&blob_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.indexes.remove_document(collection, id).await;
        Ok(())
    }

    /// Every document in a collection. An absent collection yields empty.
    pub async fn find_all(&self, collection: &str) -> MeshResult<Vec<Document>> {
        let _guard = self.lock.read().await;
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(doc) = self.read_locked(collection, id).await? {
                docs.push(doc);
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    /// Number of documents in a collection.
    pub async fn count(&self, collection: &str) -> MeshResult<u64> {
        let _guard = self.lock.read().await;
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Create a collection directory eagerly.
    pub async fn create_collection(&self, collection: &str) -> MeshResult<()> {
        fs::create_dir_all(self.collection_dir(collection)).await?;
        Ok(())
    }

    /// Remove a collection directory with all documents, blobs and indexes.
    pub async fn drop_collection(&self, collection: &str) -> MeshResult<()> {
        let _guard = self.lock.write().await;
        let dir = self.collection_dir(collection);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MeshError::NotFound {
                collection: collection.to_string(),
                key: collection.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an index and backfill it from the existing document set.
    pub async fn create_index(&self, definition: IndexDefinition) -> MeshResult<()> {
        let collection = definition.collection.clone();
        let index = self.indexes.create(definition).await?;
        for doc in self.find_all(&collection).await? {
            index.insert(&doc).await;
        }
        Ok(())
    }

    /// Drop an index.
    pub async fn drop_index(&self, collection: &str, name: &str) -> MeshResult<()> {
        self.indexes.drop(collection, name).await
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(id: &str, entry_type: EntryType, fields: &[(&str, JsonValue)]) -> Document {
        let payload = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new(id, entry_type, payload)
    }

    #[tokio::test]
    async fn test_insert_find_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();

        let d = doc("alice", EntryType::Auth, &[("role", json!("admin"))]);
        store.insert("users", d.clone()).await.unwrap();

        let found = store.find("users", "alice").await.unwrap();
        assert_eq!(found, d);
    }

    #[tokio::test]
    async fn test_find_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        let err = store.find("users", "ghost").await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { .. }));
        assert!(store.try_find("users", "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_requires_id() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        let err = store
            .insert("users", doc("", EntryType::Auth, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_memory_blob_moves_to_sidecar() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();

        let d = doc(
            "m1",
            EntryType::Memory,
            &[
                ("source", json!("web")),
                ("vector", json!([0.45, 0.12])),
                ("blob", json!("raw blob contents")),
            ],
        );
        store.insert("memory", d).await.unwrap();

        // On disk: no blob, a blobRef pointing at the sidecar.
        let raw = std::fs::read_to_string(temp.path().join("memory").join("m1.json")).unwrap();
        let on_disk: JsonValue = serde_json::from_str(&raw).unwrap();
        assert!(on_disk.get("blob").is_none());
        let blob_ref = on_disk["blobRef"].as_str().unwrap();
        assert!(blob_ref.ends_with(&format!("memory{}blobs{}m1", std::path::MAIN_SEPARATOR, std::path::MAIN_SEPARATOR)));
        assert_eq!(
            std::fs::read_to_string(blob_ref).unwrap(),
            "raw blob contents"
        );

        // On read: blob restored, blobRef gone.
        let found = store.find("memory", "m1").await.unwrap();
        assert_eq!(found.payload["blob"], json!("raw blob contents"));
        assert!(found.payload.get("blobRef").is_none());
    }

    #[tokio::test]
    async fn test_sensitive_fields_encrypted_at_rest() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        store
            .install_master_key(MasterKey::new(b"master".to_vec()))
            .unwrap();

        let d = doc(
            "alice",
            EntryType::Auth,
            &[
                ("hash", json!("abc")),
                ("salt", json!("xyz")),
                ("role", json!("user")),
            ],
        );
        store.insert("credentials", d.clone()).await.unwrap();

        let raw =
            std::fs::read_to_string(temp.path().join("credentials").join("alice.json")).unwrap();
        let on_disk: JsonValue = serde_json::from_str(&raw).unwrap();
        assert_ne!(on_disk["hash"], json!("abc"));
        assert_ne!(on_disk["salt"], json!("xyz"));
        assert_eq!(on_disk["role"], json!("user"));
        assert_eq!(on_disk["hash_encrypted"], json!(true));
        assert_eq!(on_disk["salt_encrypted"], json!(true));
        assert_eq!(on_disk["encrypted"], json!(true));
        assert!(on_disk["encryption_key_id"].is_string());

        let found = store.find("credentials", "alice").await.unwrap();
        assert_eq!(found, d);
    }

    #[tokio::test]
    async fn test_sensitive_collection_without_key_writes_clear() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();

        let d = doc("bob", EntryType::Auth, &[("hash", json!("clear"))]);
        store.insert("credentials", d.clone()).await.unwrap();

        let raw = std::fs::read_to_string(temp.path().join("credentials").join("bob.json")).unwrap();
        let on_disk: JsonValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk["hash"], json!("clear"));
        assert!(on_disk.get("encrypted").is_none());

        assert_eq!(store.find("credentials", "bob").await.unwrap(), d);
    }

    #[tokio::test]
    async fn test_master_key_installed_twice_errors() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        store
            .install_master_key(MasterKey::new(b"one".to_vec()))
            .unwrap();
        let err = store
            .install_master_key(MasterKey::new(b"two".to_vec()))
            .unwrap_err();
        assert!(matches!(err, MeshError::Crypto { .. }));
    }

    #[tokio::test]
    async fn test_update_overlays_fields() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        store
            .insert(
                "users",
                doc("u1", EntryType::Auth, &[("a", json!(1)), ("b", json!(2))]),
            )
            .await
            .unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("b".to_string(), json!(20));
        changes.insert("c".to_string(), json!(3));
        let updated = store.update("users", "u1", changes).await.unwrap();

        assert_eq!(updated.payload["a"], json!(1));
        assert_eq!(updated.payload["b"], json!(20));
        assert_eq!(updated.payload["c"], json!(3));
        assert_eq!(store.find("users", "u1").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_delete_removes_document_blob_and_index_entries() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        store
            .create_index(IndexDefinition {
                name: "source".to_string(),
                collection: "memory".to_string(),
                kind: crate::index::IndexKind::Exact,
                fields: vec!["source".to_string()],
                unique: false,
                partial: None,
                dimensions: None,
            })
            .await
            .unwrap();

        store
            .insert(
                "memory",
                doc(
                    "m1",
                    EntryType::Memory,
                    &[("source", json!("web")), ("blob", json!("bytes"))],
                ),
            )
            .await
            .unwrap();

        store.delete("memory", "m1").await.unwrap();
        assert!(!temp.path().join("memory").join("m1.json").exists());
        assert!(!temp.path().join("memory").join("blobs").join("m1").exists());
        let hits = store
            .indexes()
            .query(
                "memory",
                "source",
                &crate::index::IndexQuery::Exact(vec![json!("web")]),
            )
            .await
            .unwrap();
        assert!(hits.is_empty());

        let err = store.delete("memory", "m1").await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_all_reads_through_normal_path() {
        let temp = TempDir::new().unwrap();
        let store = DocumentStore::open(temp.path()).await.unwrap();
        assert!(store.find_all("empty").await.unwrap().is_empty());

        for i in 0..3 {
            store
                .insert(
                    "users",
                    doc(&format!("u{i}"), EntryType::Auth, &[("n", json!(i))]),
                )
                .await
                .unwrap();
        }
        let all = store.find_all("users").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "u0");
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_indexes() {
        let temp = TempDir::new().unwrap();
        {
            let store = DocumentStore::open(temp.path()).await.unwrap();
            store
                .create_index(IndexDefinition {
                    name: "username".to_string(),
                    collection: "users".to_string(),
                    kind: crate::index::IndexKind::Exact,
                    fields: vec!["username".to_string()],
                    unique: true,
                    partial: None,
                    dimensions: None,
                })
                .await
                .unwrap();
            store
                .insert(
                    "users",
                    doc("u1", EntryType::Auth, &[("username", json!("alice"))]),
                )
                .await
                .unwrap();
        }

        let reopened = DocumentStore::open(temp.path()).await.unwrap();
        let hits = reopened
            .indexes()
            .query(
                "users",
                "username",
                &crate::index::IndexQuery::Exact(vec![json!("alice")]),
            )
            .await
            .unwrap();
        assert_eq!(hits, vec!["u1".to_string()]);
    }
}
