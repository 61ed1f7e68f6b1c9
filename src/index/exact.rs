//! Exact-match index over a composite key.
//!
//! Keys are built by concatenating the keyed field values with a unit
//! separator, B-tree ordered so equal lookups and future range scans stay
//! cheap. A unique index skips inserts whose key is already populated by a
//! different document.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

/// Separator between composite key components.
const KEY_SEPARATOR: char = '\u{1f}';

/// Render a single field value into its key component.
pub(crate) fn key_component(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// In-memory body of an exact index.
#[derive(Debug, Default)]
pub struct ExactIndex {
    /// composite key -> document ids
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ExactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the composite key for a document, if every keyed field is present.
    pub fn composite_key(fields: &[String], payload: &serde_json::Map<String, JsonValue>) -> Option<String> {
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            parts.push(key_component(payload.get(field)?));
        }
        Some(parts.join(&KEY_SEPARATOR.to_string()))
    }

    /// Insert a document under its composite key.
    ///
    /// Returns `false` when a unique constraint skips the insert.
    pub fn insert(&mut self, key: String, id: &str, unique: bool) -> bool {
        let bucket = self.entries.entry(key).or_default();
        if unique && !bucket.is_empty() && !bucket.contains(id) {
            return false;
        }
        bucket.insert(id.to_string());
        true
    }

    /// Remove a document id from every bucket it appears in.
    pub fn remove(&mut self, id: &str) {
        self.entries.retain(|_, bucket| {
            bucket.remove(id);
            !bucket.is_empty()
        });
    }

    /// Look up document ids by literal key values.
    pub fn lookup(&self, values: &[JsonValue]) -> Vec<String> {
        let key = values
            .iter()
            .map(key_component)
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());
        self.entries
            .get(&key)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct composite keys.
    pub fn cardinality(&self) -> usize {
        self.entries.len()
    }
}
