//! Line-boundary text chunker with overlap.
//!
//! Splits a document's normalized text into [`Chunk`]s no longer than
//! `max_chars`. Splitting prefers line ends (one normalized block per
//! line), then whitespace, then a hard cut.
//!
//! Each chunk receives a deterministic ID derived from its node ID and
//! sequence index, plus a SHA-256 hash of its text.
//!
//! # Algorithm
//!
//! 1. Walk the text in chars. The first chunk's budget is `max_chars`; later
//!    chunks spend `overlap` chars on the tail of the previous chunk's body,
//!    leaving `max_chars - overlap` for new text.
//! 2. If the remaining text fits the budget, it becomes the final chunk.
//! 3. Otherwise cut at the last line end inside the window
//!    `[min_chars - overlap, budget]`, else at the last whitespace inside
//!    it, else exactly at the budget.
//! 4. Repeat from the cut.
//!
//! Chunk bodies (text minus leading overlap) partition the input exactly,
//! so concatenating them reconstructs it. There is no randomness and no
//! clock dependence: the same text always yields the same chunks.
//!
//! # Example
//!
//! ```rust
//! use notion_index_core::chunk::{chunk_text, ChunkingParams};
//! # use notion_index_core::models::{NodeKind, SourceNode};
//! # let node = SourceNode {
//! #     node_id: "n1".into(),
//! #     parent_id: None,
//! #     kind: NodeKind::Page { title: String::new() },
//! #     has_children: false,
//! #     last_edited_at: chrono::Utc::now(),
//! #     url: None,
//! # };
//! let params = ChunkingParams { max_chars: 100, min_chars: 0, overlap_chars: 10 };
//! let chunks = chunk_text(&node, &"A".repeat(250), &params);
//! let lens: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
//! assert_eq!(lens, vec![100, 100, 70]);
//! assert_eq!(chunks[2].chunk_id, "n1#2");
//! ```

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{Chunk, NormalizedDocument, SourceNode};

/// Chunk sizing, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Upper bound on chunk length in chars, overlap included.
    pub max_chars: usize,
    /// Lower bound on every chunk except a node's last one.
    pub min_chars: usize,
    /// Chars of trailing text repeated from the previous chunk.
    pub overlap_chars: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            min_chars: 200,
            overlap_chars: 200,
        }
    }
}

impl ChunkingParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(Error::InvalidConfig("max_chars must be > 0".into()));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(Error::InvalidConfig(
                "overlap_chars must be smaller than max_chars".into(),
            ));
        }
        if self.min_chars > self.max_chars - self.overlap_chars {
            return Err(Error::InvalidConfig(
                "min_chars must not exceed max_chars - overlap_chars".into(),
            ));
        }
        Ok(())
    }
}

/// Chunk a normalized document.
pub fn chunk_document(doc: &NormalizedDocument, params: &ChunkingParams) -> Vec<Chunk> {
    chunk_text(&doc.node, &doc.text(), params)
}

/// Split `text` belonging to `node` into ordered chunks.
///
/// # Guarantees
///
/// - Empty or whitespace-only text yields no chunks.
/// - Sequence indices are contiguous: `0, 1, 2, …, N-1`.
/// - Every chunk is at most `max_chars` chars long.
/// - Every chunk but the last is at least `min_chars` chars long.
pub fn chunk_text(node: &SourceNode, text: &str, params: &ChunkingParams) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = chars.len();
    let byte_at = |i: usize| if i >= total { text.len() } else { chars[i].0 };

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut prev_body_len = 0usize;

    while pos < total {
        let overlap = if chunks.is_empty() {
            0
        } else {
            params.overlap_chars.min(prev_body_len)
        };
        let budget = params.max_chars.saturating_sub(overlap).max(1);

        let end = if total - pos <= budget {
            total
        } else {
            let limit = pos + budget;
            let floor = (pos + params.min_chars.saturating_sub(overlap).max(1)).min(limit);
            last_cut(&chars, floor, limit, |c| c == '\n')
                .or_else(|| last_cut(&chars, floor, limit, char::is_whitespace))
                .unwrap_or(limit)
        };

        let start = pos - overlap;
        let piece = &text[byte_at(start)..byte_at(end)];
        chunks.push(make_chunk(node, chunks.len() as u32, piece, overlap));

        prev_body_len = end - pos;
        pos = end;
    }

    chunks
}

/// Find the largest cut position in `floor..=limit` whose preceding char
/// satisfies `is_boundary`. A cut at `i` means the chunk ends before `chars[i]`.
fn last_cut(
    chars: &[(usize, char)],
    floor: usize,
    limit: usize,
    is_boundary: impl Fn(char) -> bool,
) -> Option<usize> {
    (floor.max(1)..=limit)
        .rev()
        .find(|&i| is_boundary(chars[i - 1].1))
}

fn make_chunk(node: &SourceNode, index: u32, text: &str, overlap: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_id: Chunk::chunk_id_for(&node.node_id, index),
        source_node_id: node.node_id.clone(),
        sequence_index: index,
        text: text.to_string(),
        overlap,
        content_hash,
        source_last_edited_at: node.last_edited_at,
        title: node.title().map(str::to_string),
        url: node.url.clone(),
    }
}
