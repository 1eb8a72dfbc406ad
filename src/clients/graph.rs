//! Graph engine adapter (Neo4j HTTP transactional API).
//!
//! Statements run through `POST /db/{database}/tx/commit`; each result row
//! is reassembled into a `{column: value}` object so callers never deal
//! with the columns/rows split.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::Neo4jSettings;
use crate::error::AppError;
use crate::retry::{retry, RetryPolicy};

#[async_trait]
pub trait GraphEngine: Send + Sync {
    async fn execute(&self, stmt: &str, params: Value) -> Result<Vec<Value>, AppError>;

    async fn ping(&self) -> bool;
}

pub struct GraphClient {
    client: reqwest::Client,
    commit_url: String,
    root_url: String,
    user: String,
    password: String,
    retry_policy: RetryPolicy,
}

impl GraphClient {
    pub fn new(settings: &Neo4jSettings) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        let root = settings.http_url.trim_end_matches('/').to_string();
        GraphClient {
            commit_url: format!("{}/db/{}/tx/commit", root, settings.database),
            root_url: root,
            client,
            user: settings.user.clone(),
            password: settings.password.clone(),
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn commit(&self, stmt: &str, params: &Value) -> Result<Value, AppError> {
        let body = json!({
            "statements": [{ "statement": stmt, "parameters": params }]
        });
        let resp = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::graph_engine(e.to_string(), e.is_timeout() || e.is_connect()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::graph_engine(
                format!("graph engine returned {}", status),
                status.is_server_error(),
            ));
        }
        resp.json()
            .await
            .map_err(|e| AppError::graph_engine(e.to_string(), false))
    }
}

#[async_trait]
impl GraphEngine for GraphClient {
    async fn execute(&self, stmt: &str, params: Value) -> Result<Vec<Value>, AppError> {
        let jv = retry(self.retry_policy, "graph.execute", || self.commit(stmt, &params)).await?;

        if let Some(errors) = jv["errors"].as_array() {
            if let Some(first) = errors.first() {
                let message = first["message"].as_str().unwrap_or("unknown engine error");
                // Statement errors are not retryable — the query is wrong.
                return Err(AppError::graph_engine(message.to_string(), false));
            }
        }

        let mut rows = Vec::new();
        if let Some(result) = jv["results"].as_array().and_then(|r| r.first()) {
            let columns: Vec<String> = result["columns"]
                .as_array()
                .map(|cols| {
                    cols.iter()
                        .filter_map(|c| c.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            if let Some(data) = result["data"].as_array() {
                for item in data {
                    if let Some(values) = item["row"].as_array() {
                        let mut row = Map::new();
                        for (col, value) in columns.iter().zip(values.iter()) {
                            row.insert(col.clone(), value.clone());
                        }
                        rows.push(Value::Object(row));
                    }
                }
            }
        }
        Ok(rows)
    }

    async fn ping(&self) -> bool {
        self.client
            .get(&self.root_url)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
