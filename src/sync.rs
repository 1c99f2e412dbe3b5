//! Sync orchestrator: scan → diff → apply → checkpoint.
//!
//! # Cycle
//!
//! 1. **Scanning**: verify the embedder and index agree on dimension, load
//!    the checkpoint, walk the tree from the root. Pages edited since the
//!    checkpoint have their content walked (and kept for step 3); the rest
//!    reuse the child pages and databases recorded for them.
//! 2. **Diffing**: classify every document as new, updated, unchanged or
//!    deleted by `last_edited_at` (see [`notion_index_core::diff`]).
//! 3. **Applying**: new and updated documents are extracted, chunked,
//!    embedded in provider-sized batches and written with
//!    [`VectorIndex::replace_node`]; deleted documents are removed by
//!    filter. Nodes run in parallel up to `concurrency`.
//! 4. **Checkpoint**: the version map advances only for nodes that were
//!    applied. Failed nodes keep their old entry and are retried next cycle.
//!    Child records are saved for every page the map tracks.
//!
//! Per-node failures are collected in the [`SyncReport`]. Fatal errors
//! (dimension mismatch, checkpoint or config store failure) stop the
//! cycle: in-flight nodes finish, no checkpoint is written, the state
//! becomes `Failed` and the error is returned.
//!
//! # Concurrency
//!
//! Cycles never overlap. A trigger that arrives while a cycle runs waits
//! for it; if that cycle started after the trigger was issued, its result
//! is shared, otherwise one fresh cycle runs for all waiting triggers.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use notion_index_core::chunk::{chunk_document, ChunkingParams};
use notion_index_core::diff::{classify, next_version_map, ChangeKind, SyncPlan};
use notion_index_core::embedding::{check_dimension, EmbeddingClient};
use notion_index_core::models::{Chunk, SourceNode, SyncCheckpoint, VectorRecord};
use notion_index_core::source::DocumentClient;
use notion_index_core::store::{RecordFilter, VectorIndex};
use notion_index_core::{Error, Result};

use crate::checkpoint::CheckpointStore;
use crate::extract::{normalize, Blocks, ContentExtractor, KnownTree, ScanResult};
use crate::retry::{ExternalCall, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Scanning,
    Diffing,
    Applying,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub change: ChangeKind,
    pub code: &'static str,
    pub reason: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub root_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub chunks_written: usize,
    pub chunks_removed: usize,
    pub failed: Vec<NodeFailure>,
    /// Nodes not attempted because the cycle was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
    pub checkpoint_written: bool,
}

impl SyncReport {
    fn new(run_id: String, root_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            root_id: root_id.to_string(),
            started_at,
            finished_at: started_at,
            added: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            chunks_written: 0,
            chunks_removed: 0,
            failed: Vec::new(),
            skipped: 0,
            cancelled: false,
            checkpoint_written: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} added, {} updated, {} deleted, {} unchanged, {} failed ({} chunks written, {} removed)",
            self.added,
            self.updated,
            self.deleted,
            self.unchanged,
            self.failed.len(),
            self.chunks_written,
            self.chunks_removed
        );
        if self.cancelled {
            s.push_str(&format!("; cancelled, {} nodes skipped", self.skipped));
        }
        s
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub chunking: ChunkingParams,
    pub concurrency: usize,
    pub embed_batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingParams::default(),
            concurrency: 4,
            embed_batch_size: 64,
            retry: RetryPolicy::default(),
        }
    }
}

enum NodeOutcome {
    Applied {
        node_id: String,
        change: ChangeKind,
        written: usize,
        removed: usize,
    },
    Failed(NodeFailure),
    Fatal(Error),
    Skipped,
}

struct Completed {
    /// Highest trigger ticket this cycle answers.
    covered: u64,
    root_id: String,
    result: Result<SyncReport>,
}

pub struct SyncOrchestrator {
    extractor: ContentExtractor,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    checkpoints: CheckpointStore,
    options: SyncOptions,
    gate: Mutex<Option<Completed>>,
    tickets: AtomicU64,
    state: watch::Sender<SyncState>,
    last_report: StdMutex<Option<SyncReport>>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn DocumentClient>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        checkpoints: CheckpointStore,
        options: SyncOptions,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            extractor: ContentExtractor::new(source, options.retry),
            embedder,
            index,
            checkpoints,
            options,
            gate: Mutex::new(None),
            tickets: AtomicU64::new(0),
            state,
            last_report: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Run one sync cycle for `root_id`, coalescing with any cycle in
    /// progress.
    pub async fn run_sync(&self, root_id: &str) -> Result<SyncReport> {
        self.run_sync_with_cancel(root_id, CancellationToken::new())
            .await
    }

    /// [`run_sync`](Self::run_sync) with cooperative cancellation, checked
    /// between nodes.
    pub async fn run_sync_with_cancel(
        &self,
        root_id: &str,
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let mut gate = self.gate.lock().await;
        if let Some(done) = gate.as_ref() {
            if done.covered >= ticket && done.root_id == root_id {
                debug!(ticket, root_id, "coalesced into completed cycle");
                return done.result.clone();
            }
        }
        let covered = self.tickets.load(Ordering::SeqCst);
        let result = self.run_cycle(root_id, &cancel).await;
        if let Ok(report) = &result {
            if let Ok(mut last) = self.last_report.lock() {
                *last = Some(report.clone());
            }
        }
        *gate = Some(Completed {
            covered,
            root_id: root_id.to_string(),
            result: result.clone(),
        });
        result
    }

    /// Drop the checkpoint so the next cycle treats every document as new.
    pub async fn reset_checkpoint(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.checkpoints.clear().await
    }

    fn set_state(&self, state: SyncState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            info!(from = %prev, to = %state, "sync state");
        }
    }

    async fn run_cycle(&self, root_id: &str, cancel: &CancellationToken) -> Result<SyncReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync", run_id = %run_id, root = root_id);
        let result = self
            .cycle(run_id.clone(), root_id, cancel)
            .instrument(span)
            .await;
        match &result {
            Ok(report) => {
                self.set_state(SyncState::Idle);
                info!(run_id = %run_id, "{}", report.summary());
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                warn!(run_id = %run_id, error = %e, code = e.code(), "sync cycle aborted");
            }
        }
        result
    }

    async fn cycle(
        &self,
        run_id: String,
        root_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        let mut report = SyncReport::new(run_id, root_id, started_at);

        // Scanning
        self.set_state(SyncState::Scanning);
        if self.embedder.dimension() != self.index.dimension() {
            return Err(Error::EmbeddingDimensionMismatch {
                expected: self.index.dimension(),
                actual: self.embedder.dimension(),
            });
        }
        let known = match self.checkpoints.load().await? {
            Some(cp) if cp.resource_root_id == root_id => KnownTree {
                versions: cp.node_version_map,
                children: cp.child_containers,
            },
            Some(cp) => {
                info!(
                    previous_root = %cp.resource_root_id,
                    "checkpoint belongs to another root, diffing from scratch"
                );
                KnownTree::default()
            }
            None => KnownTree::default(),
        };
        let scan = self.extractor.scan(root_id, &known).await?;
        let current = scan.versions();
        let previous = known.versions;

        // Diffing
        self.set_state(SyncState::Diffing);
        let index = &self.index;
        let indexed = self
            .options
            .retry
            .run(ExternalCall::IndexRead, "list_node_ids", move || {
                index.list_node_ids()
            })
            .await?;
        let plan = classify(&current, &previous, &indexed);
        report.unchanged = plan.unchanged.len();
        info!(
            new = plan.new.len(),
            updated = plan.updated.len(),
            deleted = plan.deleted.len(),
            unchanged = plan.unchanged.len(),
            "diff complete"
        );

        // Applying
        self.set_state(SyncState::Applying);
        let (applied, fatal) = self.apply(&plan, &scan, cancel, &mut report).await;
        if let Some(e) = fatal {
            return Err(e);
        }
        report.cancelled = cancel.is_cancelled() && report.skipped > 0;

        // Checkpoint
        let node_version_map = next_version_map(&plan, &current, &previous, &applied);
        let child_containers = scan
            .children
            .into_iter()
            .filter(|(id, _)| node_version_map.contains_key(id))
            .collect();
        let checkpoint = SyncCheckpoint {
            resource_root_id: root_id.to_string(),
            last_sync_started_at: started_at,
            last_sync_completed_at: Utc::now(),
            node_version_map,
            child_containers,
        };
        self.checkpoints.save(&checkpoint).await?;
        report.checkpoint_written = true;
        report.finished_at = checkpoint.last_sync_completed_at;
        Ok(report)
    }

    /// Apply every node of the plan. Returns the ids that were fully
    /// applied and the first fatal error, if any.
    async fn apply(
        &self,
        plan: &SyncPlan,
        scan: &ScanResult,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> (BTreeSet<String>, Option<Error>) {
        let halt = cancel.child_token();
        let work: Vec<(String, ChangeKind)> = plan
            .to_refresh()
            .map(|(id, change)| (id.to_string(), change))
            .chain(plan.deleted.iter().map(|id| (id.clone(), ChangeKind::Deleted)))
            .collect();

        let halt_ref = &halt;
        let mut outcomes = stream::iter(work)
            .map(|(node_id, change)| async move {
                let node_id = node_id.as_str();
                if halt_ref.is_cancelled() {
                    return NodeOutcome::Skipped;
                }
                let result = match change {
                    ChangeKind::Deleted => self.delete_node(node_id).await.map(|n| (0, n)),
                    _ => match scan.documents.get(node_id) {
                        Some(node) => self.refresh_node(node, scan.content.get(node_id)).await,
                        None => Err(Error::source_not_found(node_id)),
                    },
                };
                match result {
                    Ok((written, removed)) => NodeOutcome::Applied {
                        node_id: node_id.to_string(),
                        change,
                        written,
                        removed,
                    },
                    Err(e) if e.is_fatal() => NodeOutcome::Fatal(e),
                    Err(e) => {
                        warn!(node_id, change = ?change, error = %e, "node failed");
                        NodeOutcome::Failed(NodeFailure {
                            node_id: node_id.to_string(),
                            change,
                            code: e.code(),
                            reason: e.to_string(),
                        })
                    }
                }
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut applied = BTreeSet::new();
        let mut fatal = None;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                NodeOutcome::Applied {
                    node_id,
                    change,
                    written,
                    removed,
                } => {
                    match change {
                        ChangeKind::New => report.added += 1,
                        ChangeKind::Updated => report.updated += 1,
                        ChangeKind::Deleted => report.deleted += 1,
                        ChangeKind::Unchanged => {}
                    }
                    report.chunks_written += written;
                    report.chunks_removed += removed;
                    debug!(node_id = %node_id, written, removed, "node applied");
                    applied.insert(node_id);
                }
                NodeOutcome::Failed(failure) => report.failed.push(failure),
                NodeOutcome::Skipped => report.skipped += 1,
                NodeOutcome::Fatal(e) => {
                    halt.cancel();
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        report.failed.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        (applied, fatal)
    }

    /// Extract, chunk, embed and write one document. Blocks walked during
    /// the scan are used as is.
    async fn refresh_node(
        &self,
        node: &SourceNode,
        blocks: Option<&Blocks>,
    ) -> Result<(usize, usize)> {
        let doc = match blocks {
            Some(blocks) => normalize(node, blocks),
            None => self.extractor.extract(node).await?,
        };
        let chunks = chunk_document(&doc, &self.options.chunking);
        let records = self.embed_chunks(&chunks).await?;
        let index = &self.index;
        let node_id = node.node_id.as_str();
        let records = &records;
        let outcome = self
            .options
            .retry
            .run(ExternalCall::IndexWrite, "replace_node", move || {
                index.replace_node(node_id, records)
            })
            .await?;
        Ok((outcome.upserted, outcome.removed))
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<VectorRecord>> {
        let batch_size = self
            .options
            .embed_batch_size
            .min(self.embedder.max_batch_size())
            .max(1);
        let dimension = self.index.dimension();
        let mut records = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedder = &self.embedder;
            let texts = &texts;
            let vectors = self
                .options
                .retry
                .run(ExternalCall::Embedding, "embed_batch", move || {
                    embedder.embed_batch(texts)
                })
                .await?;
            if vectors.len() != batch.len() {
                return Err(Error::embedding_unavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            check_dimension(&vectors, dimension)?;
            records.extend(
                batch
                    .iter()
                    .zip(vectors)
                    .map(|(chunk, v)| VectorRecord::from_chunk(chunk, v)),
            );
        }
        Ok(records)
    }

    async fn delete_node(&self, node_id: &str) -> Result<usize> {
        let index = &self.index;
        let filter = &RecordFilter::for_node(node_id);
        self.options
            .retry
            .run(ExternalCall::IndexWrite, "delete_by_filter", move || {
                index.delete_by_filter(filter)
            })
            .await
    }
}
