//! Embedding service adapter.
//!
//! POSTs the raw text batch to `{base}/embed` and expects
//! `{"embeddings": [[f32; D]]}`. Results are cached (the same question is
//! embedded once per hour at most). Proxy env vars are suppressed — the
//! service is a local deployment.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{cache_key, cached_call, LruTtlCache};
use crate::config::EmbeddingSettings;
use crate::error::AppError;
use crate::retry::{retry, RetryPolicy};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
    dimensions: usize,
    cache: LruTtlCache<Vec<Vec<f32>>>,
    retry_policy: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        EmbeddingClient {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model_name: settings.model_name.clone(),
            dimensions: settings.dimensions,
            cache: LruTtlCache::new(2048, Duration::from_secs(3600)),
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn embed_remote(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let resp = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&json!(texts))
            .send()
            .await
            .map_err(|e| AppError::embedding(e.to_string(), e.is_timeout() || e.is_connect()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::embedding(
                format!("embedding service returned {}", status),
                status.is_server_error(),
            ));
        }

        let jv: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::embedding(e.to_string(), false))?;
        let vectors: Vec<Vec<f32>> = serde_json::from_value(jv["embeddings"].clone())
            .map_err(|_| AppError::embedding("response missing 'embeddings' list", false))?;

        if vectors.len() != texts.len() {
            return Err(AppError::embedding(
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
                false,
            ));
        }
        if let Some(v) = vectors.first() {
            if v.len() != self.dimensions {
                tracing::warn!(
                    "embedding: dimensionality {} differs from configured {}",
                    v.len(),
                    self.dimensions
                );
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let key = cache_key("embed", &self.model_name, &json!(texts));
        cached_call(&self.cache, &key, None, || {
            retry(self.retry_policy, "embedding.embed", || self.embed_remote(texts))
        })
        .await
    }
}
