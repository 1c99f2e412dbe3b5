//! Single-writer wrapper for stores without safe concurrent mutation.
//!
//! Reads pass straight through. Every mutation, including a whole
//! [`replace_node`](VectorIndex::replace_node), holds one async lock, so
//! index writes from parallel node workers are applied one at a time.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use notion_index_core::models::VectorRecord;
use notion_index_core::store::{RecordFilter, ReplaceOutcome, SearchHit, VectorIndex};
use notion_index_core::Result;

pub struct SerializedIndex {
    inner: Arc<dyn VectorIndex>,
    write_lock: Mutex<()>,
}

impl SerializedIndex {
    pub fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl VectorIndex for SerializedIndex {
    fn collection(&self) -> &str {
        self.inner.collection()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.inner.upsert(records).await
    }

    async fn delete_by_id(&self, ids: &BTreeSet<String>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete_by_id(ids).await
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete_by_filter(filter).await
    }

    async fn list_ids(&self, filter: &RecordFilter) -> Result<Vec<String>> {
        self.inner.list_ids(filter).await
    }

    async fn list_node_ids(&self) -> Result<BTreeSet<String>> {
        self.inner.list_node_ids().await
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<SearchHit>> {
        self.inner.search(query, k, filter).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn replace_node(&self, node_id: &str, records: &[VectorRecord]) -> Result<ReplaceOutcome> {
        let _guard = self.write_lock.lock().await;
        self.inner.replace_node(node_id, records).await
    }
}
