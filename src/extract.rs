//! Content extraction: tree traversal and per-document normalization.
//!
//! The [`TreeWalker`] walks one container's content depth-first, strictly
//! top down. Parent references are never followed and each node is
//! expanded at most once, so shared or cyclic references in the source
//! cannot loop. Nested pages and databases are yielded but never entered.
//! The walk is lazy (children are listed only when the walker reaches
//! them) and restartable: [`TreeWalker::cursor`] captures the pending work
//! as node ids that [`TreeWalker::resume`] continues from.
//!
//! [`ContentExtractor::scan`] discovers the documents under a root by
//! walking each changed page's content, so a page nested in a toggle,
//! column or callout is found like a top-level one. Pages whose version
//! matches the last checkpoint reuse the child containers recorded then
//! instead of being listed again. [`normalize`] turns the blocks of one
//! page into a [`NormalizedDocument`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use notion_index_core::models::{NormalizedDocument, SourceNode};
use notion_index_core::normalize::{is_skipped_kind, segment};
use notion_index_core::source::DocumentClient;
use notion_index_core::{Error, Result};

use crate::retry::{ExternalCall, RetryPolicy};

/// A page's blocks in document order, each with its depth below the page
/// (top-level blocks are at depth 1).
pub type Blocks = Vec<(SourceNode, usize)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Pending {
    /// Fetch this node, then yield it.
    Fetch { node_id: String, depth: usize },
    /// Yield an already fetched node.
    Yield { node: SourceNode, depth: usize },
    /// List this node's children.
    Expand { node_id: String, depth: usize },
}

/// Serializable position of a paused walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkCursor {
    stack: Vec<Pending>,
    expanded: Vec<String>,
}

impl WalkCursor {
    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }
}

pub struct TreeWalker {
    source: Arc<dyn DocumentClient>,
    retry: RetryPolicy,
    stack: Vec<Pending>,
    expanded: HashSet<String>,
    /// Subtrees that vanished mid-walk (404 below the root).
    pruned: Vec<String>,
}

impl TreeWalker {
    /// Walk from `root_id`, fetching the root first.
    pub fn new(source: Arc<dyn DocumentClient>, retry: RetryPolicy, root_id: &str) -> Self {
        Self::with_stack(
            source,
            retry,
            vec![Pending::Fetch {
                node_id: root_id.to_string(),
                depth: 0,
            }],
            HashSet::new(),
        )
    }

    /// Walk below an already fetched root.
    pub fn from_node(source: Arc<dyn DocumentClient>, retry: RetryPolicy, root: SourceNode) -> Self {
        Self::with_stack(
            source,
            retry,
            vec![Pending::Yield {
                node: root,
                depth: 0,
            }],
            HashSet::new(),
        )
    }

    /// Continue a walk captured with [`cursor`](Self::cursor).
    pub fn resume(source: Arc<dyn DocumentClient>, retry: RetryPolicy, cursor: WalkCursor) -> Self {
        Self::with_stack(
            source,
            retry,
            cursor.stack,
            cursor.expanded.into_iter().collect(),
        )
    }

    fn with_stack(
        source: Arc<dyn DocumentClient>,
        retry: RetryPolicy,
        stack: Vec<Pending>,
        expanded: HashSet<String>,
    ) -> Self {
        Self {
            source,
            retry,
            stack,
            expanded,
            pruned: Vec::new(),
        }
    }

    pub fn cursor(&self) -> WalkCursor {
        let mut expanded: Vec<String> = self.expanded.iter().cloned().collect();
        expanded.sort();
        WalkCursor {
            stack: self.stack.clone(),
            expanded,
        }
    }

    pub fn pruned(&self) -> &[String] {
        &self.pruned
    }

    /// The root is always entered; below it only plain blocks are.
    fn descends(node: &SourceNode, depth: usize) -> bool {
        node.has_children && (depth == 0 || !node.kind.is_container())
    }

    /// Next node in depth-first pre-order with its depth below the root,
    /// or `None` when the walk is done.
    pub async fn next(&mut self) -> Result<Option<(SourceNode, usize)>> {
        while let Some(pending) = self.stack.pop() {
            match pending {
                Pending::Fetch { node_id, depth } => {
                    let source = &self.source;
                    let id = node_id.as_str();
                    let node = self
                        .retry
                        .run(ExternalCall::Source, "get_node", move || source.get_node(id))
                        .await?;
                    self.stack.push(Pending::Yield { node, depth });
                }
                Pending::Yield { node, depth } => {
                    if Self::descends(&node, depth) {
                        self.stack.push(Pending::Expand {
                            node_id: node.node_id.clone(),
                            depth,
                        });
                    }
                    return Ok(Some((node, depth)));
                }
                Pending::Expand { node_id, depth } => {
                    if !self.expanded.insert(node_id.clone()) {
                        continue;
                    }
                    let source = &self.source;
                    let id = node_id.as_str();
                    let listed = self
                        .retry
                        .run(ExternalCall::Source, "list_children", move || {
                            source.list_children(id)
                        })
                        .await;
                    let children = match listed {
                        Ok(children) => children,
                        Err(Error::SourceNotFound(msg)) if depth > 0 => {
                            warn!(node_id = %node_id, reason = %msg, "subtree disappeared during walk");
                            self.pruned.push(node_id);
                            continue;
                        }
                        Err(e) => {
                            // Leave the node re-expandable for a resumed walk
                            self.expanded.remove(&node_id);
                            self.stack.push(Pending::Expand { node_id, depth });
                            return Err(e);
                        }
                    };
                    for child in children.into_iter().rev() {
                        self.stack.push(Pending::Yield {
                            node: child,
                            depth: depth + 1,
                        });
                    }
                }
            }
        }
        Ok(None)
    }
}

/// What the last checkpoint knows about the tree.
#[derive(Debug, Clone, Default)]
pub struct KnownTree {
    pub versions: BTreeMap<String, DateTime<Utc>>,
    /// Page id -> pages and databases found anywhere in its content.
    pub children: BTreeMap<String, Vec<String>>,
}

impl KnownTree {
    /// Recorded child containers of a page that has not changed since.
    fn reusable(&self, node: &SourceNode) -> Option<&[String]> {
        if !node.kind.is_document() || self.versions.get(&node.node_id) != Some(&node.last_edited_at) {
            return None;
        }
        self.children.get(&node.node_id).map(Vec::as_slice)
    }
}

/// Documents found under a root.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub root: SourceNode,
    /// Every page reachable from the root, by id.
    pub documents: BTreeMap<String, SourceNode>,
    /// Page id -> child pages and databases, in document order.
    pub children: BTreeMap<String, Vec<String>>,
    /// Blocks of changed pages, walked during the scan.
    pub content: BTreeMap<String, Blocks>,
    /// Containers whose subtree vanished mid-scan.
    pub pruned: Vec<String>,
}

impl ScanResult {
    pub fn versions(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.documents
            .iter()
            .map(|(id, node)| (id.clone(), node.last_edited_at))
            .collect()
    }
}

/// Normalize a page's blocks into segments.
///
/// Nested pages and databases are left to their own documents.
/// Non-text blocks are skipped, counted and logged.
pub fn normalize(node: &SourceNode, blocks: &[(SourceNode, usize)]) -> NormalizedDocument {
    let mut segments = Vec::new();
    let mut skipped = 0;
    for (block, depth) in blocks {
        if *depth == 0 || block.kind.is_container() {
            continue;
        }
        if is_skipped_kind(&block.kind) {
            debug!(
                node_id = %node.node_id,
                block_id = %block.node_id,
                kind = ?block.kind,
                "skipping non-text block"
            );
            skipped += 1;
            continue;
        }
        if let Some(seg) = segment(block, depth - 1) {
            segments.push(seg);
        }
    }
    NormalizedDocument {
        node: node.clone(),
        segments,
        skipped,
    }
}

#[derive(Clone)]
pub struct ContentExtractor {
    source: Arc<dyn DocumentClient>,
    retry: RetryPolicy,
}

impl ContentExtractor {
    pub fn new(source: Arc<dyn DocumentClient>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    async fn get_node(&self, node_id: &str) -> Result<SourceNode> {
        let source = &self.source;
        self.retry
            .run(ExternalCall::Source, "get_node", move || source.get_node(node_id))
            .await
    }

    /// Every block below `node`, without entering nested containers.
    async fn blocks(&self, node: &SourceNode) -> Result<Blocks> {
        if !node.has_children {
            return Ok(Vec::new());
        }
        let mut walker = TreeWalker::from_node(self.source.clone(), self.retry, node.clone());
        let mut blocks = Vec::new();
        while let Some((block, depth)) = walker.next().await? {
            if depth > 0 {
                blocks.push((block, depth));
            }
        }
        Ok(blocks)
    }

    /// Re-fetch recorded child containers. Ones that are gone are dropped.
    async fn recorded(&self, ids: &[String]) -> Result<Vec<SourceNode>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_node(id).await {
                Ok(node) => found.push(node),
                Err(Error::SourceNotFound(_)) => debug!(node_id = %id, "recorded child is gone"),
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Discover the documents under `root_id`.
    ///
    /// Fails with `SourceNotFound` if the root does not exist and with
    /// `SourceUnavailable` if a container cannot be listed within the
    /// retry budget and nothing is recorded for it: a partial scan cannot
    /// tell deleted from unreachable.
    pub async fn scan(&self, root_id: &str, known: &KnownTree) -> Result<ScanResult> {
        let root = self.get_node(root_id).await?;
        let mut result = ScanResult {
            root: root.clone(),
            documents: BTreeMap::new(),
            children: BTreeMap::new(),
            content: BTreeMap::new(),
            pruned: Vec::new(),
        };
        let mut seen = HashSet::new();
        let mut stack = vec![(root, true)];
        let mut reused = 0usize;

        while let Some((node, is_root)) = stack.pop() {
            if !seen.insert(node.node_id.clone()) {
                continue;
            }
            let found = match known.reusable(&node) {
                Some(ids) => {
                    reused += 1;
                    self.recorded(ids).await?
                }
                None => match self.blocks(&node).await {
                    Ok(blocks) => {
                        let found: Vec<SourceNode> = blocks
                            .iter()
                            .filter(|(b, _)| b.kind.is_container())
                            .map(|(b, _)| b.clone())
                            .collect();
                        let changed = known.versions.get(&node.node_id) != Some(&node.last_edited_at);
                        if node.kind.is_document() && changed {
                            result.content.insert(node.node_id.clone(), blocks);
                        }
                        found
                    }
                    Err(Error::SourceNotFound(msg)) if !is_root => {
                        warn!(node_id = %node.node_id, reason = %msg, "subtree disappeared during scan");
                        result.pruned.push(node.node_id);
                        continue;
                    }
                    Err(e) if !is_root && known.children.contains_key(&node.node_id) => {
                        warn!(
                            node_id = %node.node_id,
                            error = %e,
                            "listing failed, falling back to recorded children"
                        );
                        self.recorded(&known.children[&node.node_id]).await?
                    }
                    Err(e) => return Err(e),
                },
            };
            for child in found.iter().rev() {
                stack.push((child.clone(), false));
            }
            if node.kind.is_document() {
                result.children.insert(
                    node.node_id.clone(),
                    found.into_iter().map(|c| c.node_id).collect(),
                );
                result.documents.insert(node.node_id.clone(), node);
            }
        }
        debug!(
            root_id,
            documents = result.documents.len(),
            reused,
            walked = result.content.len(),
            "scan complete"
        );
        Ok(result)
    }

    /// Walk one document's content and normalize it.
    pub async fn extract(&self, node: &SourceNode) -> Result<NormalizedDocument> {
        let blocks = self.blocks(node).await?;
        Ok(normalize(node, &blocks))
    }
}
