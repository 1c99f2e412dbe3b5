//! Document source abstraction.
//!
//! The [`DocumentClient`] trait is the read-only view of the remote
//! document tree that the content extractor walks. [`InMemorySource`] is a
//! mutable tree used by tests and by hosts that feed documents directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{NodeKind, SourceNode};

/// Read access to a hierarchical document source.
///
/// Children are returned in document order. Implementations map their
/// transport failures onto `SourceUnavailable`, `SourceNotFound` or
/// `SourceRejected`.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn get_node(&self, node_id: &str) -> Result<SourceNode>;

    async fn list_children(&self, node_id: &str) -> Result<Vec<SourceNode>>;
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, SourceNode>,
    children: HashMap<String, Vec<String>>,
}

/// In-memory document tree.
///
/// Supports editing between sync cycles and records how many times each
/// node's children were listed.
#[derive(Default)]
pub struct InMemorySource {
    tree: Mutex<Tree>,
    list_calls: Mutex<BTreeMap<String, u64>>,
    failing: Mutex<HashMap<String, Error>>,
    calls: AtomicU64,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) a node, appending it to its parent's children.
    pub fn insert(&self, node: SourceNode) {
        let mut tree = self.lock_tree();
        if let Some(parent) = &node.parent_id {
            let siblings = tree.children.entry(parent.clone()).or_default();
            if !siblings.contains(&node.node_id) {
                siblings.push(node.node_id.clone());
            }
        }
        let mut node = node;
        node.has_children = tree
            .children
            .get(&node.node_id)
            .is_some_and(|c| !c.is_empty());
        if let Some(parent) = node.parent_id.clone() {
            if let Some(p) = tree.nodes.get_mut(&parent) {
                p.has_children = true;
            }
        }
        tree.nodes.insert(node.node_id.clone(), node);
    }

    /// Replace a node's kind and bump its `last_edited_at`.
    pub fn edit(&self, node_id: &str, kind: NodeKind, edited_at: DateTime<Utc>) -> bool {
        let mut tree = self.lock_tree();
        match tree.nodes.get_mut(node_id) {
            Some(node) => {
                node.kind = kind;
                node.last_edited_at = edited_at;
                true
            }
            None => false,
        }
    }

    /// Bump a node's `last_edited_at` without changing content.
    pub fn touch(&self, node_id: &str, edited_at: DateTime<Utc>) -> bool {
        let mut tree = self.lock_tree();
        match tree.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_edited_at = edited_at;
                true
            }
            None => false,
        }
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&self, node_id: &str) {
        let mut tree = self.lock_tree();
        let parent = tree.nodes.get(node_id).and_then(|n| n.parent_id.clone());
        if let Some(parent) = parent {
            let now_empty = match tree.children.get_mut(&parent) {
                Some(siblings) => {
                    siblings.retain(|id| id != node_id);
                    siblings.is_empty()
                }
                None => false,
            };
            if now_empty {
                if let Some(p) = tree.nodes.get_mut(&parent) {
                    p.has_children = false;
                }
            }
        }
        let mut stack = vec![node_id.to_string()];
        while let Some(id) = stack.pop() {
            tree.nodes.remove(&id);
            if let Some(kids) = tree.children.remove(&id) {
                stack.extend(kids);
            }
        }
    }

    /// Make every call touching `node_id` fail with `error` until cleared.
    pub fn fail_on(&self, node_id: &str, error: Error) {
        self.lock_failing().insert(node_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.lock_failing().clear();
    }

    /// How many times `list_children(node_id)` was called.
    pub fn list_calls(&self, node_id: &str) -> u64 {
        self.lock_calls().get(node_id).copied().unwrap_or(0)
    }

    /// Total calls of either method.
    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, node_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.lock_failing().get(node_id) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn lock_tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, u64>> {
        self.list_calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashMap<String, Error>> {
        self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentClient for InMemorySource {
    async fn get_node(&self, node_id: &str) -> Result<SourceNode> {
        self.check(node_id)?;
        self.lock_tree()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::source_not_found(node_id))
    }

    async fn list_children(&self, node_id: &str) -> Result<Vec<SourceNode>> {
        self.check(node_id)?;
        *self.lock_calls().entry(node_id.to_string()).or_insert(0) += 1;
        let tree = self.lock_tree();
        if !tree.nodes.contains_key(node_id) {
            return Err(Error::source_not_found(node_id));
        }
        Ok(tree
            .children
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| tree.nodes.get(id).cloned()).collect())
            .unwrap_or_default())
    }
}
