//! Query-time retrieval.
//!
//! [`Retriever`] embeds a query, searches the active collection and ranks
//! hits with the deterministic tie-break from [`notion_index_core::search`].
//! It shares nothing mutable with the sync path and may run while a cycle
//! is applying.

use std::sync::Arc;
use tracing::debug;

use notion_index_core::embedding::{check_dimension, EmbeddingClient};
use notion_index_core::search::{format_context, merge_weighted, rank_hits, RetrievalParams, RetrievedChunk};
use notion_index_core::store::{RecordFilter, SearchHit, VectorIndex};
use notion_index_core::{Error, Result};

use crate::config::RetrievalConfig;
use crate::retry::{ExternalCall, RetryPolicy};

pub struct Retriever {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    retry: RetryPolicy,
    min_similarity: f32,
    history_weight: f32,
    max_context_chars: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        retry: RetryPolicy,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            retry,
            min_similarity: config.min_similarity,
            history_weight: config.history_weight,
            max_context_chars: config.max_context_chars,
        }
    }

    fn params(&self, k: usize) -> RetrievalParams {
        RetrievalParams {
            k,
            min_similarity: self.min_similarity,
        }
    }

    /// Top-`k` chunks for `query`, highest similarity first.
    ///
    /// Returns an empty list for a blank query, an empty index, or when no
    /// hit clears the similarity floor. Embedding failures surface as
    /// `EmbeddingUnavailable`.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<RetrievedChunk>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let hits = self.search_raw(query, k, filter).await?;
        let ranked = rank_hits(hits, &self.params(k));
        debug!(k, returned = ranked.len(), "retrieve");
        Ok(ranked)
    }

    /// Like [`retrieve`](Self::retrieve), also searching with the joined
    /// conversation history. History hits are scaled by `history_weight`
    /// and merged by chunk id, keeping the better score.
    pub async fn retrieve_with_history(
        &self,
        query: &str,
        history: &[String],
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<RetrievedChunk>> {
        let history_text = history
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if history_text.is_empty() {
            return self.retrieve(query, k, filter).await;
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let primary = if query.trim().is_empty() {
            Vec::new()
        } else {
            self.search_raw(query, k, filter).await?
        };
        let secondary = self.search_raw(&history_text, k, filter).await?;
        let merged = merge_weighted(primary, secondary, self.history_weight);
        Ok(rank_hits(merged, &self.params(k)))
    }

    /// Retrieve and render the hits as a prompt context block.
    pub async fn context(
        &self,
        query: &str,
        history: &[String],
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<String> {
        let chunks = self.retrieve_with_history(query, history, k, filter).await?;
        Ok(self.render(&chunks))
    }

    /// Render already-ranked chunks within `max_context_chars`.
    pub fn render(&self, chunks: &[RetrievedChunk]) -> String {
        format_context(chunks, self.max_context_chars)
    }

    async fn search_raw(
        &self,
        text: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<SearchHit>> {
        let query_vec = self.embed_query(text).await?;
        let all = RecordFilter::all();
        let filter = filter.unwrap_or(&all);
        let index = &self.index;
        let query_vec = query_vec.as_slice();
        self.retry
            .run(ExternalCall::IndexRead, "search", move || {
                index.search(query_vec, k, filter)
            })
            .await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = &self.embedder;
        let texts = &[text.to_string()];
        let vectors = self
            .retry
            .run(ExternalCall::Embedding, "embed_query", move || {
                embedder.embed_batch(texts)
            })
            .await
            .map_err(as_unavailable)?;
        check_dimension(&vectors, self.index.dimension())?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding_unavailable("provider returned no vector for query"))
    }
}

fn as_unavailable(e: Error) -> Error {
    match e {
        Error::EmbeddingUnavailable(_)
        | Error::EmbeddingDimensionMismatch { .. }
        | Error::InvalidConfig(_) => e,
        other => Error::embedding_unavailable(other.to_string()),
    }
}
