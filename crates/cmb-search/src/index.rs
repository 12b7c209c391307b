use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::snippet::render_declaration;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const MIN_TOKEN_LEN: usize = 2;

/// Input document for one indexed tool.
#[derive(Debug, Clone)]
pub struct ToolSearchEntry {
    /// Qualified tool name (`namespace__tool`).
    pub name: String,
    pub description: String,
    /// Original upstream JSON Schema, used only for snippet generation.
    pub raw_schema: Value,
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSearchResult {
    pub name: String,
    pub description: String,
    /// Pre-rendered type-declaration snippet for the tool.
    pub schema: String,
}

struct Doc {
    name: String,
    description: String,
    schema: String,
    /// Term frequencies over `name + " " + description`.
    terms: HashMap<String, usize>,
    len: usize,
}

#[derive(Default)]
struct Snapshot {
    docs: Vec<Doc>,
    /// Document frequency per term.
    df: HashMap<String, usize>,
    avg_len: f64,
}

/// BM25-ranked search over tool names and descriptions.
///
/// `rebuild` replaces the whole snapshot; there is no incremental update
/// path because upstream changes arrive as full per-namespace tool lists.
pub struct ToolSearchIndex {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Default for ToolSearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSearchIndex {
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(Arc::new(Snapshot::default())) }
    }

    /// Build the index from scratch, atomically replacing the previous
    /// snapshot. Snippet rendering is best-effort: a schema that cannot be
    /// rendered yields an empty snippet, never a failed build.
    pub fn rebuild(&self, entries: &[ToolSearchEntry]) {
        let mut docs = Vec::with_capacity(entries.len());
        let mut df: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for entry in entries {
            let mut terms: HashMap<String, usize> = HashMap::new();
            let text = format!("{} {}", entry.name, entry.description);
            for token in tokenize(&text) {
                *terms.entry(token).or_insert(0) += 1;
            }
            let len: usize = terms.values().sum();
            total_len += len;
            for term in terms.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            docs.push(Doc {
                name: entry.name.clone(),
                description: entry.description.clone(),
                schema: render_declaration(&entry.name, &entry.raw_schema),
                terms,
                len,
            });
        }

        let avg_len = if docs.is_empty() { 0.0 } else { total_len as f64 / docs.len() as f64 };
        let next = Arc::new(Snapshot { docs, df, avg_len });
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Top-`limit` documents by descending BM25 score. Zero-score documents
    /// are omitted; ties keep insertion order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<ToolSearchResult> {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone();
        if snapshot.docs.is_empty() || limit == 0 {
            return Vec::new();
        }

        let query_terms: Vec<String> = tokenize(query).collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let doc_count = snapshot.docs.len() as f64;
        let mut scored: Vec<(usize, f64)> = Vec::new();
        for (position, doc) in snapshot.docs.iter().enumerate() {
            let mut score = 0.0;
            for term in &query_terms {
                let tf = *doc.terms.get(term).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let df = *snapshot.df.get(term).unwrap_or(&0) as f64;
                // Robertson–Spärck Jones IDF with +1 smoothing: rare terms
                // contribute positively and common terms never hit log(0).
                let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                let norm = 1.0 - BM25_B + BM25_B * doc.len as f64 / snapshot.avg_len;
                score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * norm);
            }
            if score > 0.0 {
                scored.push((position, score));
            }
        }

        // Stable sort keeps insertion order for equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(position, _)| {
                let doc = &snapshot.docs[position];
                ToolSearchResult {
                    name: doc.name.clone(),
                    description: doc.description.clone(),
                    schema: doc.schema.clone(),
                }
            })
            .collect()
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercase, split on non-alphanumeric, drop tokens shorter than two
/// characters.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .map(|t| t.to_lowercase())
}
