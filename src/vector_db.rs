use crate::error::{AssistantError, Result};
use lazy_static::lazy_static;
use ndarray::Array1;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

pub const DOCSTORE_FILE: &str = "docstore.json";

/// A passage as persisted in the docstore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DocStore {
    nodes: Vec<Node>,
}

/// A passage returned by a search, with its relevance score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RetrievedNode {
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, Value>,
    pub score: f32,
}

impl RetrievedNode {
    pub fn title(&self) -> Option<&str> {
        self.metadata
            .get("title")
            .or_else(|| self.metadata.get("file_name"))
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
    }

    /// Page numbers are stored either as numbers or numeric strings.
    pub fn page_number(&self) -> Option<u32> {
        match self.metadata.get("page_number")? {
            Value::Number(n) => n.as_u64().and_then(|p| u32::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get("document_id").and_then(Value::as_str)
    }
}

#[derive(Debug)]
struct IndexedNode {
    node: Node,
    embedding: Array1<f32>,
}

/// Read-only index over the persisted passages. Built once at load time.
#[derive(Debug)]
pub struct VectorDB {
    nodes: Vec<IndexedNode>,
    vocabulary: FxHashMap<String, usize>,
    idf_values: Vec<f32>,
}

impl VectorDB {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(AssistantError::index_load(dir, "storage directory not found"));
        }

        let docstore_path = dir.join(DOCSTORE_FILE);
        let raw = fs::read_to_string(&docstore_path)
            .map_err(|e| AssistantError::index_load(&docstore_path, e))?;
        let store: DocStore = serde_json::from_str(&raw)
            .map_err(|e| AssistantError::index_load(&docstore_path, e))?;

        if store.nodes.is_empty() {
            warn!(path = %docstore_path.display(), "index contains no nodes");
        }

        let db = Self::from_nodes(store.nodes);
        info!(
            nodes = db.len(),
            vocabulary = db.vocabulary.len(),
            "loaded index from {}",
            dir.display()
        );
        Ok(db)
    }

    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let tokenized: Vec<Vec<String>> = nodes.iter().map(|n| tokenize(&n.text)).collect();

        let mut vocabulary = FxHashMap::default();
        let mut doc_freq: Vec<f32> = Vec::new();
        for tokens in &tokenized {
            let unique: FxHashSet<&String> = tokens.iter().collect();
            for token in unique {
                let next = vocabulary.len();
                let idx = *vocabulary.entry(token.clone()).or_insert(next);
                if idx == doc_freq.len() {
                    doc_freq.push(0.0);
                }
                doc_freq[idx] += 1.0;
            }
        }

        let doc_count = nodes.len() as f32;
        let idf_values = doc_freq
            .iter()
            .map(|df| (1.0 + doc_count / (1.0 + df)).ln())
            .collect();

        let mut db = VectorDB {
            nodes: Vec::with_capacity(nodes.len()),
            vocabulary,
            idf_values,
        };

        for (mut node, tokens) in nodes.into_iter().zip(tokenized) {
            if node.id.is_empty() {
                node.id = uuid::Uuid::new_v4().to_string();
            }
            let embedding = db.calculate_tfidf(&tokens);
            db.nodes.push(IndexedNode { node, embedding });
        }

        db
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top-k passages by cosine similarity. Ties keep index order.
    pub fn search_similar(&self, query: &str, top_k: usize) -> Vec<RetrievedNode> {
        if top_k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }

        let query_embedding = self.calculate_tfidf(&tokenize(query));

        let mut scored: Vec<(f32, &IndexedNode)> = self
            .nodes
            .iter()
            .map(|n| (cosine_similarity(&n.embedding, &query_embedding), n))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(top_k);

        debug!(query, hits = scored.len(), "searched index");

        scored
            .into_iter()
            .map(|(score, indexed)| RetrievedNode {
                id: indexed.node.id.clone(),
                text: indexed.node.text.clone(),
                metadata: indexed.node.metadata.clone(),
                score,
            })
            .collect()
    }

    fn calculate_tfidf(&self, tokens: &[String]) -> Array1<f32> {
        let mut tfidf = Array1::<f32>::zeros(self.vocabulary.len());
        if tokens.is_empty() {
            return tfidf;
        }

        let mut term_freq: FxHashMap<&str, f32> = FxHashMap::default();
        for token in tokens {
            *term_freq.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        let tokens_count = tokens.len() as f32;
        for (term, count) in term_freq {
            // terms unseen at load time carry no weight
            if let Some(&idx) = self.vocabulary.get(term) {
                tfidf[idx] = (count / tokens_count) * self.idf_values[idx];
            }
        }

        tfidf
    }
}

fn tokenize(text: &str) -> Vec<String> {
    lazy_static! {
        static ref STOP_WORDS: FxHashSet<&'static str> = {
            let words = vec![
                "a", "an", "and", "are", "as", "at", "be", "by", "for", "from",
                "has", "he", "in", "is", "it", "its", "of", "on", "that", "the",
                "to", "was", "were", "will", "with"
            ];
            words.into_iter().collect()
        };
        static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").expect("valid regex");
    }

    let text = text.nfc().collect::<String>().to_lowercase();
    let text = NON_WORD.replace_all(&text, " ");

    text.split_whitespace()
        .filter(|&token| !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    let dot_product = a.dot(b);
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot_product / (norm_a * norm_b)).clamp(0.0, 1.0)
    }
}
