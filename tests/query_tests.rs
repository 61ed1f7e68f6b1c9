//! End-to-end query flows: planner choice, index-backed GETs, similarity
//! search, and the sensitive/blob store transformations seen through the
//! command language.

use meshdb::{
    Condition, CompareOp, Database, Document, EntryType, ExecutionResult, IndexDefinition,
    IndexKind, MasterKey, ScanType,
};
use serde_json::{json, Map, Value as JsonValue};
use tempfile::TempDir;

fn payload(fields: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn docs(result: ExecutionResult) -> Vec<Document> {
    match result {
        ExecutionResult::Documents(docs) => docs,
        other => panic!("expected documents, got {other:?}"),
    }
}

#[tokio::test]
async fn planner_picks_unique_username_index() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();

    db.execute("CREATE INDEX users:username ON users (username) UNIQUE")
        .await
        .unwrap();
    db.execute("CREATE INDEX users:email ON users (email)")
        .await
        .unwrap();

    let users = db.collection("users").await;
    for i in 0..20 {
        users
            .insert(Document::new(
                format!("u{i:02}"),
                EntryType::Auth,
                payload(&[
                    ("username", json!(format!("user{i:02}"))),
                    ("email", json!(format!("user{i:02}@example.com"))),
                ]),
            ))
            .await
            .unwrap();
    }
    users
        .insert(Document::new(
            "alice",
            EntryType::Auth,
            payload(&[("username", json!("alice")), ("email", json!("alice@example.com"))]),
        ))
        .await
        .unwrap();

    let filters = vec![Condition::new("username", CompareOp::Eq, json!("alice"))];
    let plan = db.executor().explain("users", &filters, None).await.unwrap();

    assert!(plan.use_index);
    assert_eq!(plan.index_name.as_deref(), Some("username"));
    assert_eq!(plan.scan_type, ScanType::IndexOnlyScan);
    assert!(plan.post_filters.is_empty());
    let full_scan_cost = 1.0 + 21.0;
    assert!(plan.estimated_cost < full_scan_cost);

    let found = docs(
        db.execute("GET AUTH FROM users WHERE username = 'alice'")
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "alice");

    db.shutdown().await;
}

#[tokio::test]
async fn full_scan_applies_post_filters() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();
    let users = db.collection("users").await;

    for (id, active) in [("a", true), ("b", false), ("c", true)] {
        users
            .insert(Document::new(
                id,
                EntryType::Auth,
                payload(&[("active", json!(active))]),
            ))
            .await
            .unwrap();
    }

    let found = docs(
        db.execute("GET AUTH FROM users WHERE active = true")
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].id, "a");
    assert_eq!(found[1].id, "c");

    let limited = docs(
        db.execute("GET AUTH FROM users WHERE active = true LIMIT 1")
            .await
            .unwrap(),
    );
    assert_eq!(limited.len(), 1);

    db.shutdown().await;
}

#[tokio::test]
async fn similar_to_orders_by_cosine_score() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();
    let notes = db.collection("memory").await;

    let vectors = [
        ("m1", vec![1.0, 0.0]),
        ("m2", vec![0.7, 0.7]),
        ("m3", vec![0.0, 1.0]),
    ];
    for (id, vector) in &vectors {
        notes
            .insert(Document::new(
                *id,
                EntryType::Memory,
                payload(&[("vector", json!(vector))]),
            ))
            .await
            .unwrap();
    }

    let found = docs(
        db.execute("GET MEMORY SIMILAR TO [1.0, 0.0] LIMIT 2")
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].id, "m1");
    assert_eq!(found[1].id, "m2");

    db.shutdown().await;
}

#[tokio::test]
async fn ann_index_scores_and_orders_ids() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();

    db.create_index(IndexDefinition {
        name: "embedding".to_string(),
        collection: "memory".to_string(),
        kind: IndexKind::Ann,
        fields: vec!["vector".to_string()],
        unique: false,
        partial: None,
        dimensions: Some(2),
    })
    .await
    .unwrap();

    let notes = db.collection("memory").await;
    for (id, vector) in [("far", vec![0.0, 1.0]), ("near", vec![1.0, 0.0])] {
        notes
            .insert(Document::new(
                id,
                EntryType::Memory,
                payload(&[("vector", json!(vector))]),
            ))
            .await
            .unwrap();
    }

    let hits = db
        .store()
        .indexes()
        .query(
            "memory",
            "embedding",
            &meshdb::IndexQuery::Nearest {
                vector: vec![1.0, 0.0],
                limit: Some(2),
            },
        )
        .await
        .unwrap();
    assert_eq!(hits, vec!["near".to_string(), "far".to_string()]);

    db.shutdown().await;
}

#[tokio::test]
async fn memory_blob_round_trips_through_commands() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();

    db.collection("memory")
        .await
        .insert(Document::new(
            "m1",
            EntryType::Memory,
            payload(&[
                ("source", json!("web")),
                ("vector", json!([0.45, 0.12])),
                ("blob", json!("the blob body")),
            ]),
        ))
        .await
        .unwrap();

    // Disk holds the reference, not the body.
    let raw = std::fs::read_to_string(temp.path().join("memory").join("m1.json")).unwrap();
    assert!(!raw.contains("the blob body"));
    assert!(raw.contains("blobRef"));

    let found = docs(db.execute("GET MEMORY WHERE id = 'm1'").await.unwrap());
    assert_eq!(found[0].payload["blob"], json!("the blob body"));
    assert!(found[0].payload.get("blobRef").is_none());

    db.shutdown().await;
}

#[tokio::test]
async fn sensitive_collection_round_trips_through_commands() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();
    db.install_master_key(MasterKey::new(b"e2e master key".to_vec()))
        .unwrap();

    db.collection("credentials")
        .await
        .insert(Document::new(
            "alice",
            EntryType::Auth,
            payload(&[
                ("hash", json!("abc")),
                ("salt", json!("xyz")),
                ("role", json!("user")),
            ]),
        ))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(temp.path().join("credentials").join("alice.json")).unwrap();
    assert!(!raw.contains("abc"));
    assert!(!raw.contains("xyz"));
    assert!(raw.contains("\"role\": \"user\"") || raw.contains("\"role\":\"user\""));

    let found = docs(
        db.execute("GET AUTH FROM credentials WHERE id = 'alice'")
            .await
            .unwrap(),
    );
    assert_eq!(found[0].payload["hash"], json!("abc"));
    assert_eq!(found[0].payload["salt"], json!("xyz"));
    assert!(found[0].payload.get("hash_encrypted").is_none());
    assert!(found[0].payload.get("encrypted").is_none());

    db.shutdown().await;
}

#[tokio::test]
async fn unique_index_skips_conflicting_insert() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path()).await.unwrap();
    db.execute("CREATE INDEX users:username ON users (username) UNIQUE")
        .await
        .unwrap();

    let users = db.collection("users").await;
    for i in 0..10 {
        users
            .insert(Document::new(
                format!("u{i}"),
                EntryType::Auth,
                payload(&[("username", json!(format!("user{i}")))]),
            ))
            .await
            .unwrap();
    }
    for id in ["first", "second"] {
        users
            .insert(Document::new(
                id,
                EntryType::Auth,
                payload(&[("username", json!("taken"))]),
            ))
            .await
            .unwrap();
    }

    // The second document exists but is not indexed under the taken key.
    let found = docs(
        db.execute("GET AUTH FROM users WHERE username = 'taken'")
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "first");
    assert!(users.find("second").await.is_ok());

    db.shutdown().await;
}
