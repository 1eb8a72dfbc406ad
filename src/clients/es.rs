//! Elasticsearch adapter.
//!
//! Thin HTTP wrapper over the search API: lexical queries, script-score
//! cosine knn over a dense-vector field, document writes and deletes.
//! The client is built with `.no_proxy()` so proxy env vars never capture
//! traffic to the local cluster.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::EsSettings;
use crate::error::AppError;
use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

#[async_trait]
pub trait TextIndex: Send + Sync {
    /// Run a query-DSL fragment (the content of `"query"`).
    async fn search(&self, index: &str, query: Value, size: usize)
        -> Result<Vec<SearchHit>, AppError>;

    /// Cosine-similarity knn over a dense-vector field. Scores are in [0, 2]
    /// upstream; the +1.0 shift is removed before returning.
    async fn knn(
        &self,
        index: &str,
        field: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, AppError>;

    async fn index_doc(&self, index: &str, doc: Value, id: Option<&str>) -> Result<(), AppError>;

    async fn delete_doc(&self, index: &str, id: &str) -> Result<(), AppError>;

    async fn delete_by_query(&self, index: &str, query: Value) -> Result<u64, AppError>;

    async fn ping(&self) -> bool;
}

pub struct EsClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    retry_policy: RetryPolicy,
}

impl EsClient {
    pub fn new(settings: &EsSettings) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        EsClient {
            client,
            base_url: settings.url(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, AppError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::text_index(e.to_string(), e.is_timeout() || e.is_connect()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(AppError::text_index(
                format!("{} on {}: {}", status, path, detail.chars().take(300).collect::<String>()),
                status.is_server_error(),
            ));
        }
        resp.json()
            .await
            .map_err(|e| AppError::text_index(e.to_string(), false))
    }

    fn parse_hits(jv: &Value) -> Vec<SearchHit> {
        jv["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| SearchHit {
                        id: hit["_id"].as_str().unwrap_or_default().to_string(),
                        score: hit["_score"].as_f64().unwrap_or(0.0),
                        source: hit["_source"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextIndex for EsClient {
    async fn search(
        &self,
        index: &str,
        query: Value,
        size: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        let body = json!({ "query": query, "size": size });
        let path = format!("{}/_search", index);
        let jv = retry(self.retry_policy, "es.search", || self.post_json(&path, &body)).await?;
        Ok(Self::parse_hits(&jv))
    }

    async fn knn(
        &self,
        index: &str,
        field: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        // script_score keeps compatibility with pre-kNN-API clusters; the
        // +1.0 keeps the score positive as required by ES.
        let body = json!({
            "query": {
                "script_score": {
                    "query": { "match_all": {} },
                    "script": {
                        "source": format!("cosineSimilarity(params.query_vector, '{}') + 1.0", field),
                        "params": { "query_vector": vector }
                    }
                }
            },
            "size": k
        });
        let path = format!("{}/_search", index);
        let jv = retry(self.retry_policy, "es.knn", || self.post_json(&path, &body)).await?;

        let mut hits = Self::parse_hits(&jv);
        for hit in &mut hits {
            hit.score = (hit.score - 1.0).max(0.0);
        }
        Ok(hits)
    }

    async fn index_doc(&self, index: &str, doc: Value, id: Option<&str>) -> Result<(), AppError> {
        let path = match id {
            Some(id) => format!("{}/_doc/{}", index, id),
            None => format!("{}/_doc", index),
        };
        retry(self.retry_policy, "es.index_doc", || self.post_json(&path, &doc)).await?;
        Ok(())
    }

    async fn delete_doc(&self, index: &str, id: &str) -> Result<(), AppError> {
        let resp = self
            .client
            .delete(format!("{}/{}/_doc/{}", self.base_url, index, id))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| AppError::text_index(e.to_string(), e.is_timeout() || e.is_connect()))?;

        // 404 is fine — deletes are idempotent.
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            return Err(AppError::text_index(
                format!("delete {} returned {}", id, status),
                status.is_server_error(),
            ));
        }
        Ok(())
    }

    async fn delete_by_query(&self, index: &str, query: Value) -> Result<u64, AppError> {
        let body = json!({ "query": query });
        let path = format!("{}/_delete_by_query", index);
        let jv = retry(self.retry_policy, "es.delete_by_query", || self.post_json(&path, &body))
            .await?;
        Ok(jv["deleted"].as_u64().unwrap_or(0))
    }

    async fn ping(&self) -> bool {
        self.client
            .get(format!("{}/_cluster/health", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
