//! Embedding backends and the retrying batcher.
//!
//! Backends implement [`Embedder`]:
//! - **[`DisabledEmbedder`]**: produces no vectors; chunks are stored without embeddings.
//! - **[`OpenAIEmbedder`]**: `POST {base}/v1/embeddings` (OpenAI or a compatible gateway).
//! - **[`OllamaEmbedder`]**: `POST {base}/api/embed` on a local Ollama server.
//!
//! [`EmbeddingBatcher`] wraps a backend: one batched request per call,
//! retried with exponential backoff, and checked for a one-to-one,
//! order-preserving result.
//!
//! # Error classification
//!
//! - HTTP 429 and 5xx → transient, retried
//! - Network errors → transient, retried
//! - Other HTTP 4xx → fail immediately
//!
//! Vectors are stored as little-endian `f32` BLOBs via [`vec_to_blob`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::{EmbeddingConfig, Secrets};
use crate::error::SyncError;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::Embedder;

/// Create the backend named by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig, secrets: &Secrets) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config, secrets)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Batcher ============

/// Retrying, length-checked front for an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingBatcher {
    embedder: Arc<dyn Embedder>,
    policy: RetryPolicy,
}

impl EmbeddingBatcher {
    pub fn new(embedder: Arc<dyn Embedder>, policy: RetryPolicy) -> Self {
        Self { embedder, policy }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self::new(
            embedder,
            RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.retry_base_millis),
            ),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_enabled()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed `texts` in one request (plus retries).
    ///
    /// Returns exactly one vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.embedder.as_ref();
        let vectors = retry_transient(&self.policy, "embedding", move || async move {
            embedder.embed(texts).await
        })
        .await?;

        if vectors.len() != texts.len() {
            bail!(
                "embedding backend returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        Ok(vectors)
    }
}

// ============ Disabled ============

/// Backend used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings endpoint. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: Option<usize>,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig, secrets: &Secrets) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = secrets
            .openai_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(dims) = self.dims {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::transient("openai", format!("request failed: {}", e)))?;

        let json = check_response("openai", response).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Local Ollama server, default `http://localhost:11434`.
pub struct OllamaEmbedder {
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::transient("ollama", format!("request failed: {}", e)))?;

        let json = check_response("ollama", response).await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings"))?;

        embeddings
            .iter()
            .map(|e| {
                e.as_array()
                    .map(|values| to_f32_vec(values))
                    .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
            })
            .collect()
    }
}

// ============ Helpers ============

/// Classify a response: 429/5xx are transient, other failures are permanent.
async fn check_response(service: &str, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body_text = response.text().await.unwrap_or_default();
    let snippet: String = body_text.chars().take(300).collect();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(SyncError::transient(service, format!("HTTP {}: {}", status, snippet)).into());
    }
    bail!("{} API error {}: {}", service, status, snippet)
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_first: usize,
        drop_one: bool,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(SyncError::transient("test", "HTTP 429").into());
            }
            let take = if self.drop_one { texts.len() - 1 } else { texts.len() };
            Ok(texts.iter().take(take).map(|t| vec![t.len() as f32]).collect())
        }
    }

    fn batcher(fail_first: usize, drop_one: bool) -> (EmbeddingBatcher, Arc<CountingEmbedder>) {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_first,
            drop_one,
        });
        let b = EmbeddingBatcher::new(inner.clone(), RetryPolicy::new(3, Duration::from_millis(1)));
        (b, inner)
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let (b, inner) = batcher(2, false);
        let out = b.embed(&["ab".to_string(), "cde".to_string()]).await.unwrap();
        assert_eq!(out, vec![vec![2.0], vec![3.0]]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (b, inner) = batcher(5, false);
        let err = b.embed(&["x".to_string()]).await.unwrap_err();
        assert!(SyncError::is_transient(&err));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn length_mismatch_is_an_error() {
        let (b, _) = batcher(0, true);
        assert!(b.embed(&["a".to_string(), "b".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let (b, inner) = batcher(0, false);
        assert!(b.embed(&[]).await.unwrap().is_empty());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]},
            ]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![vec![1.0], vec![2.0]]);
    }
}
