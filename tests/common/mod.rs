#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use notion_index::checkpoint::CheckpointStore;
use notion_index::retry::RetryPolicy;
use notion_index::sync::{SyncOptions, SyncOrchestrator};
use notion_index_core::chunk::ChunkingParams;
use notion_index_core::embedding::EmbeddingClient;
use notion_index_core::kv::InMemoryConfigStore;
use notion_index_core::models::{NodeKind, SourceNode};
use notion_index_core::source::InMemorySource;
use notion_index_core::store::memory::InMemoryIndex;
use notion_index_core::{Error, Result};

pub const DIM: usize = 256;
pub const COLLECTION: &str = "docs";

pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
}

pub fn page(id: &str, parent: Option<&str>, title: &str, minute: u32) -> SourceNode {
    SourceNode {
        node_id: id.to_string(),
        parent_id: parent.map(str::to_string),
        kind: NodeKind::Page {
            title: title.to_string(),
        },
        has_children: false,
        last_edited_at: ts(minute),
        url: Some(format!("https://www.notion.so/{}", id)),
    }
}

pub fn block(id: &str, parent: &str, kind: NodeKind) -> SourceNode {
    SourceNode {
        node_id: id.to_string(),
        parent_id: Some(parent.to_string()),
        kind,
        has_children: false,
        last_edited_at: ts(0),
        url: None,
    }
}

pub fn para(id: &str, parent: &str, text: &str) -> SourceNode {
    block(
        id,
        parent,
        NodeKind::Paragraph {
            text: text.to_string(),
        },
    )
}

/// Workspace used by most tests:
///
/// ```text
/// root "Handbook"
/// ├── root-p   paragraph
/// ├── deploy   page: two paragraphs
/// ├── oncall   page: toggle with a nested paragraph
/// ├── pets     page: one paragraph
/// └── db       database
///     └── faq  page: one paragraph
/// ```
pub fn workspace() -> Arc<InMemorySource> {
    let src = Arc::new(InMemorySource::new());
    src.insert(page("root", None, "Handbook", 0));
    src.insert(para("root-p", "root", "welcome to the engineering handbook"));

    src.insert(page("deploy", Some("root"), "Deploying", 1));
    src.insert(para(
        "deploy-1",
        "deploy",
        "we deploy services to kubernetes with helm charts",
    ));
    src.insert(para(
        "deploy-2",
        "deploy",
        "rollbacks use the previous helm release",
    ));

    src.insert(page("oncall", Some("root"), "Oncall", 2));
    src.insert(block(
        "oncall-t",
        "oncall",
        NodeKind::Toggle {
            text: "escalation".into(),
        },
    ));
    src.insert(para(
        "oncall-t1",
        "oncall-t",
        "page the secondary after fifteen minutes",
    ));

    src.insert(page("pets", Some("root"), "Office pets", 3));
    src.insert(para("pets-1", "pets", "the office cat is named biscuit"));

    src.insert(SourceNode {
        kind: NodeKind::Database {
            title: "FAQ".into(),
        },
        url: None,
        ..page("db", Some("root"), "", 4)
    });
    src.insert(page("faq", Some("db"), "VPN", 5));
    src.insert(para("faq-1", "faq", "connect to the vpn before ssh"));
    src
}

/// Deterministic bag-of-words embedder: each lowercase word is hashed into
/// one of `DIM` buckets and the vector is L2-normalized.
pub struct BagOfWords {
    dimension: usize,
    /// Texts containing this marker fail with the paired error.
    poison: Mutex<Option<(String, Error)>>,
    pub texts_embedded: AtomicU64,
}

impl BagOfWords {
    pub fn new() -> Self {
        Self::with_dimension(DIM)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            poison: Mutex::new(None),
            texts_embedded: AtomicU64::new(0),
        }
    }

    pub fn poison(&self, marker: &str, error: Error) {
        *self.poison.lock().unwrap() = Some((marker.to_string(), error));
    }

    pub fn cure(&self) {
        *self.poison.lock().unwrap() = None;
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dimension as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some((marker, err)) = self.poison.lock().unwrap().as_ref() {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(err.clone());
            }
        }
        self.texts_embedded
            .fetch_add(texts.len() as u64, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Wraps an embedder so every batch waits for a permit.
pub struct Gated {
    inner: Arc<BagOfWords>,
    permits: Semaphore,
    pub entered: Notify,
}

impl Gated {
    pub fn new(inner: Arc<BagOfWords>) -> Self {
        Self {
            inner,
            permits: Semaphore::new(0),
            entered: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.permits.add_permits(1 << 20);
    }
}

#[async_trait]
impl EmbeddingClient for Gated {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.entered.notify_one();
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::embedding_unavailable(e.to_string()))?;
        permit.forget();
        self.inner.embed_batch(texts).await
    }
}

/// Source, index, config store and embedder shared across cycles.
pub struct Harness {
    pub source: Arc<InMemorySource>,
    pub index: Arc<InMemoryIndex>,
    pub kv: Arc<InMemoryConfigStore>,
    pub embedder: Arc<BagOfWords>,
}

impl Harness {
    pub fn new(source: Arc<InMemorySource>) -> Self {
        Self {
            source,
            index: Arc::new(InMemoryIndex::new(COLLECTION, DIM)),
            kv: Arc::new(InMemoryConfigStore::new()),
            embedder: Arc::new(BagOfWords::new()),
        }
    }

    pub fn options(concurrency: usize) -> SyncOptions {
        SyncOptions {
            chunking: ChunkingParams {
                max_chars: 60,
                min_chars: 10,
                overlap_chars: 10,
            },
            concurrency,
            embed_batch_size: 8,
            retry: RetryPolicy::immediate(2),
        }
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.kv.clone(), COLLECTION)
    }

    /// A fresh orchestrator over the shared state, as after a restart.
    pub fn orchestrator(&self) -> SyncOrchestrator {
        self.orchestrator_with(self.embedder.clone(), 4)
    }

    pub fn orchestrator_with(
        &self,
        embedder: Arc<dyn EmbeddingClient>,
        concurrency: usize,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.source.clone(),
            embedder,
            self.index.clone(),
            self.checkpoints(),
            Self::options(concurrency),
        )
    }

    /// Chunk ids currently indexed for `node_id`, in order.
    pub fn chunk_ids(&self, node_id: &str) -> Vec<String> {
        self.index
            .records()
            .into_iter()
            .filter(|r| r.metadata.source_node_id == node_id)
            .map(|r| r.chunk_id)
            .collect()
    }

    pub fn indexed_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .index
            .records()
            .into_iter()
            .map(|r| r.metadata.source_node_id)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}
