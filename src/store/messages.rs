//! Message append/read over cache and search index.
//!
//! Appends write the cache list (fatal on failure) and index a document
//! per message (warn-and-continue). Reads are cache-first; a miss queries
//! the index for the whole `(user, session)` transcript, sorted ascending
//! by timestamp, and refills the cache with a fresh TTL.

use std::sync::atomic::Ordering;

use chrono::Utc;
use serde_json::json;

use crate::error::AppError;
use crate::models::StoredMessage;

use super::{SessionStore, MESSAGE_CACHE_TTL};

impl SessionStore {
    pub async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let message = StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: timestamp.clone(),
        };

        // Cache write is the primary path for the hot read side.
        if let Some(kv) = &self.kv {
            let key = Self::messages_key(user_id, session_id);
            let raw = serde_json::to_string(&message)
                .map_err(|e| AppError::Cache(format!("message encode failed: {}", e)))?;
            kv.rpush(&key, &raw);
            kv.expire(&key, MESSAGE_CACHE_TTL);
        }

        // Monotonic id: a second append in the same millisecond advances by 1.
        let wall_ms = now.timestamp_millis();
        let prev = self
            .last_message_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.max(wall_ms - 1) + 1)
            })
            .unwrap_or(wall_ms - 1);
        let ms = prev.max(wall_ms - 1) + 1;
        let message_id = format!("msg_{}_{}", session_id, ms);

        let doc = json!({
            "user_id": user_id,
            "session_id": session_id,
            "message_id": message_id,
            "role": role,
            "content": content,
            "timestamp": timestamp,
            "message_order": ms,
        });
        if let Err(e) = self
            .es
            .index_doc(&self.conversation_index, doc, Some(&message_id))
            .await
        {
            tracing::warn!("message index write failed (non-fatal): {}", e);
        } else {
            tracing::debug!("message indexed: {}", message_id);
        }

        self.touch_session(session_id).await;

        Ok(())
    }

    pub async fn get_messages(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, AppError> {
        let key = Self::messages_key(user_id, session_id);

        if let Some(kv) = &self.kv {
            if let Some(items) = kv.lrange(&key) {
                let messages: Vec<StoredMessage> = items
                    .iter()
                    .filter_map(|raw| serde_json::from_str(raw).ok())
                    .collect();
                return Ok(messages);
            }
        }

        let messages = self.messages_from_index(user_id, session_id).await;

        if let Some(kv) = &self.kv {
            if !messages.is_empty() {
                for message in &messages {
                    if let Ok(raw) = serde_json::to_string(message) {
                        kv.rpush(&key, &raw);
                    }
                }
                kv.expire(&key, MESSAGE_CACHE_TTL);
                tracing::info!(
                    "cache refill: {} messages for user={} session={}",
                    messages.len(),
                    user_id,
                    session_id
                );
            }
        }

        Ok(messages)
    }

    /// Index read. Failures degrade to an empty transcript — the index is
    /// only consulted when the cache is cold.
    async fn messages_from_index(&self, user_id: &str, session_id: &str) -> Vec<StoredMessage> {
        let query = json!({
            "bool": {
                "must": [
                    { "term": { "user_id": user_id } },
                    { "term": { "session_id": session_id } },
                    { "exists": { "field": "role" } }
                ]
            }
        });

        let hits = match self.es.search(&self.conversation_index, query, 1000).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("message index read failed: {}", e);
                return Vec::new();
            }
        };

        let mut messages: Vec<(i64, StoredMessage)> = hits
            .into_iter()
            .filter_map(|hit| {
                let role = hit.source["role"].as_str()?.to_string();
                let content = hit.source["content"].as_str().unwrap_or_default().to_string();
                let timestamp = hit.source["timestamp"].as_str().unwrap_or_default().to_string();
                let order = hit.source["message_order"].as_i64().unwrap_or(0);
                Some((order, StoredMessage { role, content, timestamp }))
            })
            .collect();

        messages.sort_by(|a, b| {
            a.1.timestamp
                .cmp(&b.1.timestamp)
                .then_with(|| a.0.cmp(&b.0))
        });
        messages.into_iter().map(|(_, m)| m).collect()
    }

    /// Drop a session's transcript from cache and index. The session row
    /// itself is untouched.
    pub async fn clear_messages(&self, user_id: &str, session_id: &str) -> Result<(), AppError> {
        if let Some(kv) = &self.kv {
            kv.delete(&Self::messages_key(user_id, session_id));
        }

        let query = json!({
            "bool": {
                "must": [
                    { "term": { "user_id": user_id } },
                    { "term": { "session_id": session_id } },
                    { "exists": { "field": "role" } }
                ]
            }
        });
        match self.es.delete_by_query(&self.conversation_index, query).await {
            Ok(deleted) => {
                tracing::info!("cleared {} indexed messages for session {}", deleted, session_id)
            }
            Err(e) => tracing::warn!("message index clear failed (non-fatal): {}", e),
        }
        Ok(())
    }
}
