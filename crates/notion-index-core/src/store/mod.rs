//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines every storage operation the sync
//! orchestrator and retriever need, enabling pluggable backends (SQLite,
//! in-memory).
//!
//! An index is scoped to one collection: a named namespace with a fixed
//! embedding dimension. Implementations must be `Send + Sync` and safe for
//! concurrent upserts and deletes from different nodes' write paths.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::{RecordMetadata, VectorRecord};

/// Metadata predicate for deletes, listings and searches.
///
/// An empty filter matches every record. Set fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Only records whose `source_node_id` is in this set.
    #[serde(default)]
    pub node_ids: Option<BTreeSet<String>>,
    /// Only records whose source was edited at or after this instant.
    #[serde(default)]
    pub edited_since: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_node(node_id: &str) -> Self {
        Self {
            node_ids: Some(BTreeSet::from([node_id.to_string()])),
            edited_since: None,
        }
    }

    pub fn for_nodes<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_ids: Some(node_ids.into_iter().map(Into::into).collect()),
            edited_since: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_none() && self.edited_since.is_none()
    }

    pub fn matches(&self, meta: &RecordMetadata) -> bool {
        if let Some(ids) = &self.node_ids {
            if !ids.contains(&meta.source_node_id) {
                return false;
            }
        }
        if let Some(since) = self.edited_since {
            if meta.source_last_edited_at < since {
                return false;
            }
        }
        true
    }
}

/// A single similarity search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
    pub text: String,
    pub metadata: RecordMetadata,
}

/// Result of replacing one node's records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    pub upserted: usize,
    pub removed: usize,
}

/// Deterministic hit ordering: score desc, then sequence index asc, then
/// chunk ID asc.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.metadata.sequence_index.cmp(&b.metadata.sequence_index))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Sort hits with [`compare_hits`] and keep the best `k`.
pub fn top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

/// Abstract vector index for one collection.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite records by chunk ID |
/// | [`delete_by_id`](VectorIndex::delete_by_id) | Remove records by chunk ID |
/// | [`delete_by_filter`](VectorIndex::delete_by_filter) | Remove records matching a predicate |
/// | [`list_ids`](VectorIndex::list_ids) | Chunk IDs matching a predicate |
/// | [`list_node_ids`](VectorIndex::list_node_ids) | Distinct source node IDs present |
/// | [`search`](VectorIndex::search) | Top-k cosine similarity search |
/// | [`replace_node`](VectorIndex::replace_node) | Write a node's new records, then drop its superseded ones |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Collection name this index is scoped to.
    fn collection(&self) -> &str;

    /// Fixed embedding dimension of the collection.
    fn dimension(&self) -> usize;

    /// Insert or overwrite records. Rejects the whole batch with
    /// `EmbeddingDimensionMismatch` if any vector has the wrong length.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    /// Delete records by chunk ID. Missing IDs are ignored.
    async fn delete_by_id(&self, ids: &BTreeSet<String>) -> Result<usize>;

    /// Delete every record matching `filter`.
    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<usize>;

    /// Chunk IDs of records matching `filter`, sorted.
    async fn list_ids(&self, filter: &RecordFilter) -> Result<Vec<String>>;

    /// Distinct `source_node_id`s present in the collection.
    async fn list_node_ids(&self) -> Result<BTreeSet<String>>;

    /// Top-`k` records by cosine similarity, ordered by [`compare_hits`].
    async fn search(&self, query: &[f32], k: usize, filter: &RecordFilter)
        -> Result<Vec<SearchHit>>;

    /// Number of records in the collection.
    async fn count(&self) -> Result<usize>;

    /// Replace one node's records as a logical unit.
    ///
    /// New records are written first; prior chunk IDs of the node that are
    /// no longer produced are removed afterwards. Re-running after a
    /// failure converges to the same state.
    async fn replace_node(&self, node_id: &str, records: &[VectorRecord]) -> Result<ReplaceOutcome> {
        let existing = self.list_ids(&RecordFilter::for_node(node_id)).await?;
        let upserted = if records.is_empty() {
            0
        } else {
            self.upsert(records).await?
        };
        let fresh: BTreeSet<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        let orphans: BTreeSet<String> = existing
            .into_iter()
            .filter(|id| !fresh.contains(id.as_str()))
            .collect();
        let removed = if orphans.is_empty() {
            0
        } else {
            self.delete_by_id(&orphans).await?
        };
        Ok(ReplaceOutcome { upserted, removed })
    }
}
