/// Query language and execution.
///
/// The surface is a small command language over collections:
///
/// ```text
/// GET MEMORY FROM notes WHERE source = 'web' AND priority = 2 LIMIT 10
/// GET MEMORY SIMILAR TO [0.45, 0.12] LIMIT 5
/// SET api_key = 'abc123'
/// DELETE FROM users WHERE id = 'alice'
/// CREATE INDEX users:username ON users (username) UNIQUE
/// CREATE COLLECTION notes
/// DROP INDEX users:username
/// DROP COLLECTION notes
/// ```
///
/// Keywords are case-insensitive; identifiers preserve case. Literals are
/// quoted strings, numbers, and booleans. `GET` runs through the cost-based
/// planner: filters servable by an index are pushed down, the rest are
/// re-checked against the fetched documents.
use crate::error::{MeshError, MeshResult};
use crate::index::{self, IndexKind, IndexQuery};
use crate::planner::{self, CollectionStats, IndexStats, QueryPlan};
use crate::store::DocumentStore;
use crate::types::{Document, EntryType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Comparison operator in a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring (strings) or element (arrays) containment.
    Contains,
}

/// A single `<field> <op> <literal>` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: JsonValue,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: JsonValue) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate this condition against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = match self.field.as_str() {
            "id" => Some(JsonValue::String(doc.id.clone())),
            "entryType" => Some(JsonValue::String(doc.entry_type.as_str().to_string())),
            field => doc.payload.get(field).cloned(),
        };
        let Some(actual) = actual else {
            return false;
        };

        match self.op {
            CompareOp::Eq => actual == self.value,
            CompareOp::Ne => actual != self.value,
            CompareOp::Gt => compare_json(&actual, &self.value) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(
                compare_json(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare_json(&actual, &self.value) == Some(Ordering::Less),
            CompareOp::Lte => matches!(
                compare_json(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::Contains => json_contains(&actual, &self.value),
        }
    }
}

/// Compare two JSON scalars of the same shape.
fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Substring containment for strings, element containment for arrays.
fn json_contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match (haystack, needle) {
        (JsonValue::String(s), JsonValue::String(sub)) => {
            s.to_lowercase().contains(&sub.to_lowercase())
        }
        (JsonValue::Array(items), needle) => items.contains(needle),
        _ => false,
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        entry_type: EntryType,
        collection: Option<String>,
        filters: Vec<Condition>,
        similar_to: Option<Vec<f32>>,
        limit: Option<usize>,
    },
    Set {
        key: String,
        value: JsonValue,
    },
    Delete {
        collection: Option<String>,
        id: String,
    },
    CreateIndex {
        collection: String,
        name: String,
        fields: Vec<String>,
        unique: bool,
    },
    CreateCollection {
        name: String,
    },
    DropIndex {
        collection: String,
        name: String,
    },
    DropCollection {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Symbol(String),
}

fn lex(input: &str) -> MeshResult<Vec<Token>> {
    let pattern = Regex::new(
        r#"'([^']*)'|"([^"]*)"|(-?\d+(?:\.\d+)?)|([A-Za-z_][A-Za-z0-9_.-]*)|(<=|>=|!=|[=<>:(),\[\]])|(\S)"#,
    )
    .expect("token pattern is valid");

    let mut tokens = Vec::new();
    for captures in pattern.captures_iter(input) {
        if let Some(s) = captures.get(1).or_else(|| captures.get(2)) {
            tokens.push(Token::Str(s.as_str().to_string()));
        } else if let Some(n) = captures.get(3) {
            let value: f64 = n
                .as_str()
                .parse()
                .map_err(|_| MeshError::invalid(format!("bad number '{}'", n.as_str())))?;
            tokens.push(Token::Num(value));
        } else if let Some(word) = captures.get(4) {
            tokens.push(Token::Ident(word.as_str().to_string()));
        } else if let Some(sym) = captures.get(5) {
            tokens.push(Token::Symbol(sym.as_str().to_string()));
        } else if let Some(junk) = captures.get(6) {
            return Err(MeshError::invalid(format!(
                "unexpected character '{}'",
                junk.as_str()
            )));
        }
    }
    Ok(tokens)
}

/// Cursor over the token stream.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume the next token if it is the given keyword (case-insensitive).
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token::Ident(word)) = self.peek() {
            if word.eq_ignore_ascii_case(keyword) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> MeshResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(MeshError::invalid(format!("expected keyword '{keyword}'")))
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if let Some(Token::Symbol(s)) = self.peek() {
            if s == symbol {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_symbol(&mut self, symbol: &str) -> MeshResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(MeshError::invalid(format!("expected '{symbol}'")))
        }
    }

    fn expect_ident(&mut self) -> MeshResult<String> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(word),
            other => Err(MeshError::invalid(format!(
                "expected identifier, got {other:?}"
            ))),
        }
    }

    fn expect_end(&self) -> MeshResult<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(MeshError::invalid("trailing input after command"))
        }
    }

    /// Parse a literal: quoted string, number, boolean, or bare word.
    fn literal(&mut self) -> MeshResult<JsonValue> {
        match self.next() {
            Some(Token::Str(s)) => Ok(JsonValue::String(s)),
            Some(Token::Num(n)) => Ok(number_value(n)),
            Some(Token::Ident(word)) => {
                if word.eq_ignore_ascii_case("true") {
                    Ok(JsonValue::Bool(true))
                } else if word.eq_ignore_ascii_case("false") {
                    Ok(JsonValue::Bool(false))
                } else {
                    // Bare words read as strings.
                    Ok(JsonValue::String(word))
                }
            }
            other => Err(MeshError::invalid(format!("expected literal, got {other:?}"))),
        }
    }

    fn condition(&mut self) -> MeshResult<Condition> {
        let field = self.expect_ident()?;
        let op = if self.eat_symbol("=") {
            CompareOp::Eq
        } else if self.eat_symbol("!=") {
            CompareOp::Ne
        } else if self.eat_symbol(">=") {
            CompareOp::Gte
        } else if self.eat_symbol("<=") {
            CompareOp::Lte
        } else if self.eat_symbol(">") {
            CompareOp::Gt
        } else if self.eat_symbol("<") {
            CompareOp::Lt
        } else if self.eat_keyword("CONTAINS") {
            CompareOp::Contains
        } else {
            return Err(MeshError::invalid(format!(
                "expected comparison operator after '{field}'"
            )));
        };
        let value = self.literal()?;
        Ok(Condition::new(field, op, value))
    }

    /// `<coll>:<name>` pair used by CREATE/DROP INDEX.
    fn index_ref(&mut self) -> MeshResult<(String, String)> {
        let collection = self.expect_ident()?;
        self.expect_symbol(":")?;
        let name = self.expect_ident()?;
        Ok((collection, name))
    }

    fn float_list(&mut self) -> MeshResult<Vec<f32>> {
        self.expect_symbol("[")?;
        let mut floats = Vec::new();
        if !self.eat_symbol("]") {
            loop {
                match self.next() {
                    Some(Token::Num(n)) => floats.push(n as f32),
                    other => {
                        return Err(MeshError::invalid(format!(
                            "expected number in vector, got {other:?}"
                        )))
                    }
                }
                if self.eat_symbol("]") {
                    break;
                }
                self.expect_symbol(",")?;
            }
        }
        Ok(floats)
    }
}

fn number_value(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        JsonValue::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Parse a command string.
pub fn parse(input: &str) -> MeshResult<Command> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };

    let command = if parser.eat_keyword("GET") {
        let entry_type = EntryType::from(parser.expect_ident()?.to_uppercase().as_str());
        let collection = if parser.eat_keyword("FROM") {
            Some(parser.expect_ident()?)
        } else {
            None
        };

        let mut filters = Vec::new();
        if parser.eat_keyword("WHERE") {
            filters.push(parser.condition()?);
            while parser.eat_keyword("AND") {
                filters.push(parser.condition()?);
            }
        }

        let similar_to = if parser.eat_keyword("SIMILAR") {
            parser.expect_keyword("TO")?;
            Some(parser.float_list()?)
        } else {
            None
        };

        let limit = if parser.eat_keyword("LIMIT") {
            match parser.next() {
                Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => Some(n as usize),
                other => {
                    return Err(MeshError::invalid(format!(
                        "LIMIT expects a non-negative integer, got {other:?}"
                    )))
                }
            }
        } else {
            None
        };

        Command::Get {
            entry_type,
            collection,
            filters,
            similar_to,
            limit,
        }
    } else if parser.eat_keyword("SET") {
        let key = parser.expect_ident()?;
        parser.expect_symbol("=")?;
        let value = parser.literal()?;
        Command::Set { key, value }
    } else if parser.eat_keyword("DELETE") {
        let collection = if parser.eat_keyword("FROM") {
            Some(parser.expect_ident()?)
        } else {
            None
        };
        parser.expect_keyword("WHERE")?;
        let condition = parser.condition()?;
        if condition.field != "id" || condition.op != CompareOp::Eq {
            return Err(MeshError::invalid("DELETE supports only 'WHERE id = <id>'"));
        }
        let id = match condition.value {
            JsonValue::String(s) => s,
            other => other.to_string(),
        };
        Command::Delete { collection, id }
    } else if parser.eat_keyword("CREATE") {
        if parser.eat_keyword("INDEX") {
            let (collection, name) = parser.index_ref()?;
            parser.expect_keyword("ON")?;
            let on_collection = parser.expect_ident()?;
            if on_collection != collection {
                return Err(MeshError::invalid(format!(
                    "index collection '{collection}' does not match ON '{on_collection}'"
                )));
            }
            parser.expect_symbol("(")?;
            let mut fields = vec![parser.expect_ident()?];
            while parser.eat_symbol(",") {
                fields.push(parser.expect_ident()?);
            }
            parser.expect_symbol(")")?;
            let unique = parser.eat_keyword("UNIQUE");
            Command::CreateIndex {
                collection,
                name,
                fields,
                unique,
            }
        } else if parser.eat_keyword("COLLECTION") {
            Command::CreateCollection {
                name: parser.expect_ident()?,
            }
        } else {
            return Err(MeshError::invalid("expected INDEX or COLLECTION after CREATE"));
        }
    } else if parser.eat_keyword("DROP") {
        if parser.eat_keyword("INDEX") {
            let (collection, name) = parser.index_ref()?;
            Command::DropIndex { collection, name }
        } else if parser.eat_keyword("COLLECTION") {
            Command::DropCollection {
                name: parser.expect_ident()?,
            }
        } else {
            return Err(MeshError::invalid("expected INDEX or COLLECTION after DROP"));
        }
    } else {
        return Err(MeshError::invalid(format!("unrecognized command: {input}")));
    };

    parser.expect_end()?;
    Ok(command)
}

/// Executes GET commands against a store through the planner.
pub struct QueryExecutor {
    store: Arc<DocumentStore>,
}

impl QueryExecutor {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Current statistics for a collection, derived from the live indexes.
    ///
    /// Only cardinality is reported; per-key selectivity derived from it
    /// already accounts for bucket size, so `avg_bucket_size` is left to
    /// the planner's default.
    pub async fn collection_stats(&self, collection: &str) -> MeshResult<CollectionStats> {
        let total = self.store.count(collection).await?;
        let mut per_index = HashMap::new();
        for index in self.store.indexes().indexes(collection) {
            per_index.insert(
                index.definition().name.clone(),
                IndexStats {
                    cardinality: Some(index.cardinality().await as u64),
                    selectivity: None,
                    avg_bucket_size: None,
                },
            );
        }
        Ok(CollectionStats {
            total_documents: total,
            per_index,
        })
    }

    /// Plan a GET without running it.
    pub async fn explain(
        &self,
        collection: &str,
        filters: &[Condition],
        limit: Option<usize>,
    ) -> MeshResult<QueryPlan> {
        let stats = self.collection_stats(collection).await?;
        let definitions = self.store.indexes().definitions(collection);
        Ok(planner::plan(filters, &definitions, &stats, limit))
    }

    /// Run a GET.
    pub async fn get(
        &self,
        entry_type: &EntryType,
        collection: Option<String>,
        filters: Vec<Condition>,
        similar_to: Option<Vec<f32>>,
        limit: Option<usize>,
    ) -> MeshResult<Vec<Document>> {
        let collection = collection.unwrap_or_else(|| entry_type.default_collection());
        let plan = self.explain(&collection, &filters, limit).await?;

        let chosen_index = if plan.use_index {
            plan.index_name.clone()
        } else {
            None
        };
        let mut candidates: Vec<Document> = if let Some(name) = &chosen_index {
            let ids = self.index_candidates(&collection, name, &plan).await?;
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = self.store.try_find(&collection, &id).await? {
                    docs.push(doc);
                }
            }
            docs
        } else {
            self.store.find_all(&collection).await?
        };

        let recheck: &[Condition] = if plan.use_index {
            &plan.post_filters
        } else {
            &filters
        };
        candidates.retain(|doc| {
            &doc.entry_type == entry_type && recheck.iter().all(|c| c.matches(doc))
        });

        if let Some(query) = similar_to {
            let mut scored: Vec<(f32, Document)> = candidates
                .into_iter()
                .map(|doc| {
                    let score = index::extract_vector(&doc.payload)
                        .map(|v| index::cosine_similarity(&query, &v))
                        .unwrap_or(0.0);
                    (score, doc)
                })
                .collect();
            scored.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.1.id.cmp(&b.1.id))
            });
            scored.truncate(limit.unwrap_or(index::DEFAULT_LIMIT));
            return Ok(scored.into_iter().map(|(_, doc)| doc).collect());
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    /// Candidate ids from the chosen index.
    async fn index_candidates(
        &self,
        collection: &str,
        name: &str,
        plan: &QueryPlan,
    ) -> MeshResult<Vec<String>> {
        let index = self
            .store
            .indexes()
            .get(collection, name)
            .ok_or_else(|| MeshError::NotFound {
                collection: collection.to_string(),
                key: name.to_string(),
            })?;

        match index.definition().kind {
            IndexKind::Exact => {
                // Key values in the index's declared field order.
                let mut values = Vec::with_capacity(index.definition().fields.len());
                for field in &index.definition().fields {
                    let condition = plan
                        .index_filters
                        .iter()
                        .find(|c| &c.field == field)
                        .ok_or_else(|| {
                            MeshError::invalid(format!("plan lacks a value for keyed field '{field}'"))
                        })?;
                    values.push(condition.value.clone());
                }
                Ok(index.query(&IndexQuery::Exact(values)).await)
            }
            IndexKind::Inverted => {
                // Intersect the posting lists of every pushed-down token.
                let mut result: Option<Vec<String>> = None;
                for condition in &plan.index_filters {
                    let Some(text) = condition.value.as_str() else {
                        continue;
                    };
                    for token in text.split_whitespace() {
                        let hits = index.query(&IndexQuery::Token(token.to_string())).await;
                        result = Some(match result {
                            None => hits,
                            Some(prev) => prev.into_iter().filter(|id| hits.contains(id)).collect(),
                        });
                    }
                }
                Ok(result.unwrap_or_default())
            }
            IndexKind::Ann => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_get_full() {
        let cmd = parse(
            "get memory from notes where source = 'web' and priority = 2 similar to [0.1, 0.2] limit 10",
        )
        .unwrap();
        match cmd {
            Command::Get {
                entry_type,
                collection,
                filters,
                similar_to,
                limit,
            } => {
                assert_eq!(entry_type, EntryType::Memory);
                assert_eq!(collection.as_deref(), Some("notes"));
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0], Condition::new("source", CompareOp::Eq, json!("web")));
                assert_eq!(filters[1], Condition::new("priority", CompareOp::Eq, json!(2)));
                assert_eq!(similar_to, Some(vec![0.1, 0.2]));
                assert_eq!(limit, Some(10));
            }
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_keywords_case_insensitive_identifiers_preserved() {
        let cmd = parse("GET AUTH FROM Users WHERE Name = 'Alice'").unwrap();
        match cmd {
            Command::Get {
                collection, filters, ..
            } => {
                assert_eq!(collection.as_deref(), Some("Users"));
                assert_eq!(filters[0].field, "Name");
            }
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_literal_recognition() {
        let cmd = parse("GET AUTH WHERE active = true AND score = 1.5 AND tag = 'x'").unwrap();
        match cmd {
            Command::Get { filters, .. } => {
                assert_eq!(filters[0].value, json!(true));
                assert_eq!(filters[1].value, json!(1.5));
                assert_eq!(filters[2].value, json!("x"));
            }
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_and_delete() {
        assert_eq!(
            parse("SET api_key = 'secret'").unwrap(),
            Command::Set {
                key: "api_key".to_string(),
                value: json!("secret"),
            }
        );
        assert_eq!(
            parse("DELETE WHERE id = 'alice'").unwrap(),
            Command::Delete {
                collection: None,
                id: "alice".to_string(),
            }
        );
        assert_eq!(
            parse("DELETE FROM users WHERE id = 'bob'").unwrap(),
            Command::Delete {
                collection: Some("users".to_string()),
                id: "bob".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_index_and_collection_ddl() {
        assert_eq!(
            parse("CREATE INDEX users:username ON users (username) UNIQUE").unwrap(),
            Command::CreateIndex {
                collection: "users".to_string(),
                name: "username".to_string(),
                fields: vec!["username".to_string()],
                unique: true,
            }
        );
        assert_eq!(
            parse("create index users:name_email on users (name, email)").unwrap(),
            Command::CreateIndex {
                collection: "users".to_string(),
                name: "name_email".to_string(),
                fields: vec!["name".to_string(), "email".to_string()],
                unique: false,
            }
        );
        assert_eq!(
            parse("CREATE COLLECTION notes").unwrap(),
            Command::CreateCollection {
                name: "notes".to_string(),
            }
        );
        assert_eq!(
            parse("DROP INDEX users:username").unwrap(),
            Command::DropIndex {
                collection: "users".to_string(),
                name: "username".to_string(),
            }
        );
        assert_eq!(
            parse("DROP COLLECTION notes").unwrap(),
            Command::DropCollection {
                name: "notes".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(parse("").is_err());
        assert!(parse("FETCH MEMORY").is_err());
        assert!(parse("GET MEMORY WHERE").is_err());
        assert!(parse("DELETE WHERE name = 'x'").is_err());
        assert!(parse("CREATE INDEX users:x ON other (f)").is_err());
        assert!(parse("GET MEMORY LIMIT -1").is_err());
        assert!(parse("GET MEMORY trailing garbage").is_err());
    }

    #[test]
    fn test_condition_matches() {
        let mut payload = serde_json::Map::new();
        payload.insert("age".to_string(), json!(30));
        payload.insert("name".to_string(), json!("Alice Smith"));
        payload.insert("tags".to_string(), json!(["a", "b"]));
        let doc = Document::new("alice", EntryType::Auth, payload);

        assert!(Condition::new("age", CompareOp::Eq, json!(30)).matches(&doc));
        assert!(Condition::new("age", CompareOp::Gt, json!(20)).matches(&doc));
        assert!(!Condition::new("age", CompareOp::Lt, json!(20)).matches(&doc));
        assert!(Condition::new("name", CompareOp::Contains, json!("smith")).matches(&doc));
        assert!(Condition::new("tags", CompareOp::Contains, json!("a")).matches(&doc));
        assert!(Condition::new("id", CompareOp::Eq, json!("alice")).matches(&doc));
        assert!(Condition::new("entryType", CompareOp::Eq, json!("AUTH")).matches(&doc));
        assert!(!Condition::new("missing", CompareOp::Eq, json!(1)).matches(&doc));
    }
}
