//! Similarity ranking and context assembly for the retrieval path.
//!
//! The ranking algorithm operates entirely through the [`VectorIndex`]
//! trait, with no database or configuration dependencies. The calling
//! application embeds the query, constructs [`RetrievalParams`] and passes
//! the index implementation.
//!
//! # Ranking
//!
//! 1. Fetch the top `k` hits by cosine similarity.
//! 2. Drop hits below `min_similarity`.
//! 3. Sort by score (desc), sequence index (asc), chunk ID (asc).
//!
//! Conversation-aware retrieval runs a second search, scales its scores by
//! a history weight and merges the two sets by chunk ID with MAX
//! aggregation before re-ranking.

use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;
use crate::store::{top_k, RecordFilter, SearchHit, VectorIndex};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    /// Maximum results to return.
    pub k: usize,
    /// Hits scoring below this floor are dropped.
    pub min_similarity: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            k: 5,
            min_similarity: 0.0,
        }
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub source_node_id: String,
    pub sequence_index: u32,
    /// Cosine similarity, possibly history-weighted.
    pub score: f32,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

impl From<SearchHit> for RetrievedChunk {
    fn from(hit: SearchHit) -> Self {
        Self {
            chunk_id: hit.chunk_id,
            source_node_id: hit.metadata.source_node_id,
            sequence_index: hit.metadata.sequence_index,
            score: hit.score,
            text: hit.text,
            title: hit.metadata.title,
            url: hit.metadata.url,
        }
    }
}

/// Run a similarity search against a [`VectorIndex`] and rank the hits.
pub async fn search<I>(
    index: &I,
    query_vec: &[f32],
    params: &RetrievalParams,
    filter: &RecordFilter,
) -> Result<Vec<RetrievedChunk>>
where
    I: VectorIndex + ?Sized,
{
    if params.k == 0 {
        return Ok(Vec::new());
    }
    let hits = index.search(query_vec, params.k, filter).await?;
    Ok(rank_hits(hits, params))
}

/// Apply the similarity floor, order deterministically and truncate to `k`.
pub fn rank_hits(hits: Vec<SearchHit>, params: &RetrievalParams) -> Vec<RetrievedChunk> {
    let kept: Vec<SearchHit> = hits
        .into_iter()
        .filter(|h| h.score >= params.min_similarity)
        .collect();
    top_k(kept, params.k)
        .into_iter()
        .map(RetrievedChunk::from)
        .collect()
}

/// Merge a secondary hit set into a primary one.
///
/// Secondary scores are multiplied by `weight`. Hits present in both sets
/// keep the higher of the two scores.
pub fn merge_weighted(primary: Vec<SearchHit>, secondary: Vec<SearchHit>, weight: f32) -> Vec<SearchHit> {
    let mut by_id: HashMap<String, SearchHit> = HashMap::new();
    for hit in primary {
        by_id.insert(hit.chunk_id.clone(), hit);
    }
    for mut hit in secondary {
        hit.score *= weight;
        match by_id.get_mut(&hit.chunk_id) {
            Some(existing) if existing.score >= hit.score => {}
            Some(existing) => existing.score = hit.score,
            None => {
                by_id.insert(hit.chunk_id.clone(), hit);
            }
        }
    }
    by_id.into_values().collect()
}

/// Render ranked chunks as a context block for a generation step.
///
/// Each chunk becomes a `Title:` / `URL:` / `Content:` block; blocks are
/// separated by `---`. Blocks are appended in rank order until the next one
/// would push the output past `max_chars`. The first block is always
/// included, truncated if necessary.
pub fn format_context(chunks: &[RetrievedChunk], max_chars: usize) -> String {
    const SEPARATOR: &str = "\n\n---\n\n";

    let mut out = String::new();
    let mut used = 0usize;
    for (i, chunk) in chunks.iter().enumerate() {
        let block = format!(
            "Title: {}\nURL: {}\nContent: {}",
            chunk.title.as_deref().unwrap_or("Untitled"),
            chunk.url.as_deref().unwrap_or("-"),
            chunk.text
        );
        let block_len = block.chars().count();
        if i == 0 {
            if block_len > max_chars {
                return block.chars().take(max_chars).collect();
            }
            out.push_str(&block);
            used = block_len;
            continue;
        }
        let sep_len = SEPARATOR.chars().count();
        if used + sep_len + block_len > max_chars {
            break;
        }
        out.push_str(SEPARATOR);
        out.push_str(&block);
        used += sep_len + block_len;
    }
    out
}
