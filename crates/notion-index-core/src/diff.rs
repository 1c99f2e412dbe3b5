//! Three-way node diff between the current source scan and the last
//! checkpoint.
//!
//! Classification is by `last_edited_at` only; content is never compared.
//!
//! | Kind | Condition |
//! |------|-----------|
//! | `New` | id absent from the checkpoint |
//! | `Updated` | `last_edited_at` differs from the checkpoint |
//! | `Unchanged` | `last_edited_at` matches |
//! | `Deleted` | id in the checkpoint or the index, absent from the scan |

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
    Deleted,
}

/// Node ids grouped by [`ChangeKind`], each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl SyncPlan {
    /// Nodes that need chunking, embedding and an index write.
    pub fn to_refresh(&self) -> impl Iterator<Item = (&str, ChangeKind)> {
        self.new
            .iter()
            .map(|id| (id.as_str(), ChangeKind::New))
            .chain(self.updated.iter().map(|id| (id.as_str(), ChangeKind::Updated)))
    }

    /// Number of nodes that require any index mutation.
    pub fn work_len(&self) -> usize {
        self.new.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_noop(&self) -> bool {
        self.work_len() == 0
    }
}

/// Classify the scanned nodes against the previous version map.
///
/// `indexed` holds the node ids currently present in the vector index; any
/// of them missing from `current` is reported as deleted even when the
/// checkpoint never saw it.
pub fn classify(
    current: &BTreeMap<String, DateTime<Utc>>,
    previous: &BTreeMap<String, DateTime<Utc>>,
    indexed: &BTreeSet<String>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for (id, edited) in current {
        match previous.get(id) {
            None => plan.new.push(id.clone()),
            Some(prev) if prev != edited => plan.updated.push(id.clone()),
            Some(_) => plan.unchanged.push(id.clone()),
        }
    }
    let gone: BTreeSet<&String> = previous
        .keys()
        .chain(indexed.iter())
        .filter(|id| !current.contains_key(*id))
        .collect();
    plan.deleted = gone.into_iter().cloned().collect();
    plan
}

/// Build the version map to commit after applying `plan`.
///
/// Nodes in `applied` take their current version (or disappear when
/// deleted). Nodes not applied keep whatever the previous map had, so
/// failed updates and deletes are retried next cycle and failed new nodes
/// stay absent.
pub fn next_version_map(
    plan: &SyncPlan,
    current: &BTreeMap<String, DateTime<Utc>>,
    previous: &BTreeMap<String, DateTime<Utc>>,
    applied: &BTreeSet<String>,
) -> BTreeMap<String, DateTime<Utc>> {
    let mut next = BTreeMap::new();
    for id in &plan.unchanged {
        if let Some(v) = current.get(id) {
            next.insert(id.clone(), *v);
        }
    }
    for id in plan.new.iter().chain(plan.updated.iter()) {
        if applied.contains(id) {
            if let Some(v) = current.get(id) {
                next.insert(id.clone(), *v);
            }
        } else if let Some(v) = previous.get(id) {
            next.insert(id.clone(), *v);
        }
    }
    for id in &plan.deleted {
        if !applied.contains(id) {
            if let Some(v) = previous.get(id) {
                next.insert(id.clone(), *v);
            }
        }
    }
    next
}
