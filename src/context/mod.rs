use anyhow::Result;
use rusqlite::Connection;

use crate::model::{ContentEmbedding, EmbeddingType};
use crate::store;

/// Slack subtracted from the similarity floor so borderline entries are not
/// excluded by floating-point noise.
pub const SIMILARITY_EPS: f64 = 1e-6;

/// Cosine similarity of two equal-length vectors (1 equal ... 0 unrelated
/// ... -1 opposite). Vectors are assumed pre-normalized, so this is a plain
/// dot product. Mismatched lengths are a programming error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        panic!(
            "dot product requires equal-length vectors: {} vs {}",
            a.len(),
            b.len()
        );
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// One candidate chunk with its similarity to the query set.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedEntry {
    pub content_id: String,
    pub item_id: String,
    pub token_count: u32,
    pub similarity: f64,
}

/// Ranked candidates, deduplicated by content ID with one similarity each.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ranked {
    pub entries: Vec<RankedEntry>,
}

impl Ranked {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, content_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.content_id == content_id)
    }

    pub fn similarity_of(&self, content_id: &str) -> Option<f64> {
        self.find(content_id).map(|i| self.entries[i].similarity)
    }

    /// Merges another query's results into this one. A chunk appearing under
    /// both queries keeps the lower of the two similarities, never a sum or
    /// an average.
    pub fn append_all(&mut self, more: Ranked) {
        for entry in more.entries {
            match self.find(&entry.content_id) {
                Some(i) => {
                    if entry.similarity < self.entries[i].similarity {
                        self.entries[i].similarity = entry.similarity;
                    }
                }
                None => self.entries.push(entry),
            }
        }
    }

    /// Sorts by similarity descending, caps at `max_count`, then trims
    /// trailing entries below the similarity floor (minus epsilon).
    pub fn select_top(mut self, max_count: usize, min_similarity: f64) -> Ranked {
        self.entries.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.entries.truncate(max_count);

        let floor = min_similarity - SIMILARITY_EPS;
        while self
            .entries
            .last()
            .is_some_and(|e| e.similarity < floor)
        {
            self.entries.pop();
        }
        self
    }
}

/// Read-only snapshot of one account's current-type embeddings, loaded fresh
/// per processing attempt and never shared across invocations.
pub struct VectorIndex {
    pub account_id: String,
    pub embedding_type: EmbeddingType,
    entries: Vec<ContentEmbedding>,
}

impl VectorIndex {
    pub fn load(conn: &Connection, account_id: &str) -> Result<VectorIndex> {
        let entries =
            store::list_account_embeddings(conn, account_id, EmbeddingType::CURRENT)?;
        Ok(VectorIndex {
            account_id: account_id.to_string(),
            embedding_type: EmbeddingType::CURRENT,
            entries,
        })
    }

    pub fn from_entries(account_id: &str, entries: Vec<ContentEmbedding>) -> VectorIndex {
        VectorIndex {
            account_id: account_id.to_string(),
            embedding_type: EmbeddingType::CURRENT,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranks every candidate against the query vector. An empty index yields
    /// an empty result, not an error.
    pub fn select(&self, query: &[f32], max_count: usize, min_similarity: f64) -> Ranked {
        let mut ranked = Ranked::default();
        for e in &self.entries {
            ranked.entries.push(RankedEntry {
                content_id: e.content_id.clone(),
                item_id: e.item_id.clone(),
                token_count: e.token_count,
                similarity: cosine_similarity(query, &e.vector),
            });
        }
        ranked.select_top(max_count, min_similarity)
    }
}
