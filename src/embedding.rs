//! Embedding provider implementations.
//!
//! Concrete [`EmbeddingClient`]s:
//! - **[`DisabledClient`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAiClient`]**: calls the OpenAI `POST /v1/embeddings` endpoint.
//! - **[`OllamaClient`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Clients make a single attempt per call. Retry and backoff are applied by
//! the caller through [`RetryPolicy`](crate::retry::RetryPolicy), so the
//! clients only classify failures:
//! - HTTP 401/403 → `InvalidConfig` (bad or missing key, never retried)
//! - HTTP 429, 5xx, other 4xx, network errors, malformed bodies →
//!   `EmbeddingUnavailable`

use anyhow::bail;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use notion_index_core::embedding::{check_dimension, EmbeddingClient};
use notion_index_core::{Error, Result};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OPENAI_MAX_BATCH: usize = 2048;
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OLLAMA_MAX_BATCH: usize = 512;

// ============ Disabled ============

/// A no-op client that fails every call.
///
/// Used when `embedding.provider = "disabled"`. Status and config commands
/// still work; sync and search report `EmbeddingUnavailable`.
pub struct DisabledClient;

#[async_trait]
impl EmbeddingClient for DisabledClient {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dimension(&self) -> usize {
        0
    }
    fn max_batch_size(&self) -> usize {
        1
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::embedding_unavailable("embedding provider is disabled"))
    }
}

// ============ OpenAI ============

/// Embedding client for the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    url: String,
}

impl OpenAiClient {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        OPENAI_MAX_BATCH
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::embedding_unavailable(format!("OpenAI request failed: {}", e)))?;
        let json = read_json(resp, "OpenAI").await?;
        let vectors = parse_openai_response(&json)?;
        finish(vectors, texts.len(), self.dims)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::embedding_unavailable("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::embedding_unavailable("invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedding client for a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`).
pub struct OllamaClient {
    http: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaClient {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            model,
            dims,
            url,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        OLLAMA_MAX_BATCH
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let resp = self
            .http
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::embedding_unavailable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;
        let json = read_json(resp, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        finish(vectors, texts.len(), self.dims)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            Error::embedding_unavailable("invalid Ollama response: missing embeddings array")
        })?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array().map(|a| to_f32(a)).ok_or_else(|| {
                Error::embedding_unavailable("invalid Ollama response: embedding is not an array")
            })
        })
        .collect()
}

// ============ Shared ============

async fn read_json(resp: reqwest::Response, provider: &str) -> Result<serde_json::Value> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.map_err(|e| {
            Error::embedding_unavailable(format!("{} response not JSON: {}", provider, e))
        });
    }
    let body_text = resp.text().await.unwrap_or_default();
    let msg = format!("{} API error {}: {}", provider, status, body_text);
    match status.as_u16() {
        401 | 403 => Err(Error::InvalidConfig(msg)),
        _ => Err(Error::EmbeddingUnavailable(msg)),
    }
}

fn to_f32(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn finish(vectors: Vec<Vec<f32>>, expected_len: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected_len {
        return Err(Error::embedding_unavailable(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_len
        )));
    }
    check_dimension(&vectors, dims)?;
    Ok(vectors)
}

/// Create the configured [`EmbeddingClient`].
///
/// | Config Value | Client |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledClient`] |
/// | `"openai"` | [`OpenAiClient`] |
/// | `"ollama"` | [`OllamaClient`] |
pub fn create_client(
    config: &EmbeddingConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledClient)),
        "openai" => Ok(Arc::new(OpenAiClient::new(config, timeout)?)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config, timeout)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_response_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_openai_missing_data_is_unavailable() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5, 0.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.5, 0.0]]);
    }

    #[test]
    fn test_finish_checks_count_and_dimension() {
        assert!(finish(vec![vec![1.0, 2.0]], 2, 2).is_err());
        assert_eq!(
            finish(vec![vec![1.0, 2.0, 3.0]], 1, 2).unwrap_err(),
            Error::EmbeddingDimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert!(finish(vec![vec![1.0, 2.0]], 1, 2).is_ok());
    }

    #[tokio::test]
    async fn test_disabled_client_is_unavailable() {
        let err = DisabledClient
            .embed_batch(&["q".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[test]
    fn test_create_disabled() {
        let client = create_client(&EmbeddingConfig::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(client.model_name(), "disabled");
    }
}
