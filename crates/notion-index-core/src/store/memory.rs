//! In-memory [`VectorIndex`] implementation for testing and embedding.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force cosine similarity over all stored vectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::VectorRecord;

use super::{top_k, RecordFilter, SearchHit, VectorIndex};

/// In-memory index for one collection.
pub struct InMemoryIndex {
    collection: String,
    dimension: usize,
    records: RwLock<BTreeMap<String, VectorRecord>>,
    mutations: AtomicU64,
}

impl InMemoryIndex {
    pub fn new(collection: impl Into<String>, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            dimension,
            records: RwLock::new(BTreeMap::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// Number of mutating calls that changed at least one record.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of a record by chunk ID.
    pub fn get(&self, chunk_id: &str) -> Option<VectorRecord> {
        self.read().get(chunk_id).cloned()
    }

    /// Snapshot of every record, ordered by chunk ID.
    pub fn records(&self) -> Vec<VectorRecord> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, VectorRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, VectorRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, changed: usize) {
        if changed > 0 {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if let Some(bad) = records.iter().find(|r| r.embedding.len() != self.dimension) {
            return Err(Error::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: bad.embedding.len(),
            });
        }
        let mut stored = self.write();
        for r in records {
            stored.insert(r.chunk_id.clone(), r.clone());
        }
        drop(stored);
        self.bump(records.len());
        Ok(records.len())
    }

    async fn delete_by_id(&self, ids: &BTreeSet<String>) -> Result<usize> {
        let mut stored = self.write();
        let removed = ids.iter().filter(|id| stored.remove(*id).is_some()).count();
        drop(stored);
        self.bump(removed);
        Ok(removed)
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<usize> {
        let mut stored = self.write();
        let before = stored.len();
        stored.retain(|_, r| !filter.matches(&r.metadata));
        let removed = before - stored.len();
        drop(stored);
        self.bump(removed);
        Ok(removed)
    }

    async fn list_ids(&self, filter: &RecordFilter) -> Result<Vec<String>> {
        Ok(self
            .read()
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| r.chunk_id.clone())
            .collect())
    }

    async fn list_node_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read()
            .values()
            .map(|r| r.metadata.source_node_id.clone())
            .collect())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(Error::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let hits: Vec<SearchHit> = self
            .read()
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| SearchHit {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(query, &r.embedding),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordMetadata;
    use chrono::Utc;

    fn record(node: &str, seq: u32, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: format!("{}#{}", node, seq),
            text: format!("{} chunk {}", node, seq),
            embedding,
            metadata: RecordMetadata {
                source_node_id: node.to_string(),
                source_last_edited_at: Utc::now(),
                sequence_index: seq,
                content_hash: String::new(),
                title: None,
                url: None,
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_chunk_id() {
        let index = InMemoryIndex::new("docs", 2);
        let r = record("n1", 0, vec![1.0, 0.0]);
        index.upsert(&[r.clone()]).await.unwrap();
        index.upsert(&[r]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dimension() {
        let index = InMemoryIndex::new("docs", 2);
        let err = index
            .upsert(&[record("n1", 0, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::EmbeddingDimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(index.mutations(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let index = InMemoryIndex::new("docs", 2);
        let removed = index
            .delete_by_id(&BTreeSet::from(["ghost#0".to_string()]))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(index.mutations(), 0);
        assert_eq!(
            index.delete_by_filter(&RecordFilter::for_node("ghost")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_replace_node_removes_orphans_only() {
        let index = InMemoryIndex::new("docs", 2);
        index
            .upsert(&[
                record("n1", 0, vec![1.0, 0.0]),
                record("n1", 1, vec![1.0, 0.0]),
                record("n1", 2, vec![1.0, 0.0]),
                record("n2", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let outcome = index
            .replace_node("n1", &[record("n1", 0, vec![0.5, 0.5])])
            .await
            .unwrap();
        assert_eq!(outcome.upserted, 1);
        assert_eq!(outcome.removed, 2);
        assert_eq!(
            index.list_ids(&RecordFilter::all()).await.unwrap(),
            vec!["n1#0", "n2#0"]
        );
    }

    #[tokio::test]
    async fn test_search_respects_filter_and_order() {
        let index = InMemoryIndex::new("docs", 2);
        index
            .upsert(&[
                record("n1", 0, vec![1.0, 0.0]),
                record("n2", 0, vec![0.9, 0.1]),
                record("n3", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], 2, &RecordFilter::all())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["n1#0", "n2#0"]);

        let scoped = index
            .search(&[1.0, 0.0], 5, &RecordFilter::for_nodes(["n3"]))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].chunk_id, "n3#0");
    }

    #[tokio::test]
    async fn test_list_node_ids_distinct() {
        let index = InMemoryIndex::new("docs", 2);
        index
            .upsert(&[
                record("n1", 0, vec![1.0, 0.0]),
                record("n1", 1, vec![1.0, 0.0]),
                record("n2", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let nodes = index.list_node_ids().await.unwrap();
        assert_eq!(nodes.into_iter().collect::<Vec<_>>(), vec!["n1", "n2"]);
    }
}
