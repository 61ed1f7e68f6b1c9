//! Token-inverted index.
//!
//! Tokenization recurses through the keyed fields: strings are lowercased
//! and whitespace-split, arrays and objects are traversed, numbers and
//! other scalars are ignored. Each token maps to a posting list of
//! document ids.

use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};

/// In-memory body of an inverted index.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    /// token -> document ids
    postings: HashMap<String, BTreeSet<String>>,
}

/// Collect tokens from a value. Strings only; numbers never tokenize.
pub(crate) fn tokenize(value: &JsonValue, out: &mut BTreeSet<String>) {
    match value {
        JsonValue::String(s) => {
            for token in s.split_whitespace() {
                let token = token.to_lowercase();
                if !token.is_empty() {
                    out.insert(token);
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                tokenize(item, out);
            }
        }
        JsonValue::Object(map) => {
            for item in map.values() {
                tokenize(item, out);
            }
        }
        _ => {}
    }
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize the keyed fields of a payload.
    pub fn tokens_for(
        fields: &[String],
        payload: &serde_json::Map<String, JsonValue>,
    ) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        for field in fields {
            if let Some(value) = payload.get(field) {
                tokenize(value, &mut tokens);
            }
        }
        tokens
    }

    /// Add a document's tokens to the posting lists.
    pub fn insert(&mut self, tokens: BTreeSet<String>, id: &str) {
        for token in tokens {
            self.postings.entry(token).or_default().insert(id.to_string());
        }
    }

    /// Remove a document id from every posting list.
    pub fn remove(&mut self, id: &str) {
        self.postings.retain(|_, bucket| {
            bucket.remove(id);
            !bucket.is_empty()
        });
    }

    /// The posting list for a token (queried lowercase).
    pub fn lookup(&self, token: &str) -> Vec<String> {
        self.postings
            .get(&token.to_lowercase())
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct tokens.
    pub fn cardinality(&self) -> usize {
        self.postings.len()
    }
}
