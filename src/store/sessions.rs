//! Session CRUD over the three tiers.
//!
//! The row store is the write primary: a failed insert/update is the only
//! fatal outcome. Cache and search-index writes are logged and skipped on
//! failure. Deletes are soft (`is_active = 0`) and idempotent.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{SessionMeta, SessionRow};

use super::SessionStore;

impl SessionStore {
    /// Create a session for a user, auto-creating the user row on first
    /// contact. Returns the new session id.
    pub async fn create_session(
        &self,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<String, AppError> {
        let session_id = Uuid::new_v4().to_string();
        let session_name = name.filter(|n| !n.trim().is_empty()).unwrap_or("对话");
        let now = Utc::now();
        let username: String = format!("用户_{}", user_id.chars().take(8).collect::<String>());

        sqlx::query("INSERT IGNORE INTO users (user_id, username, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(&username)
            .bind(now)
            .execute(&self.db)
            .await?;

        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, name, created_at, updated_at, is_active) \
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(session_name)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        tracing::info!("session created: user={} session={}", user_id, session_id);

        if let Some(kv) = &self.kv {
            let meta = json!({ "name": session_name, "created_at": now.to_rfc3339() });
            kv.hset(&Self::sessions_key(user_id), &session_id, &meta.to_string());
        }

        let doc = json!({
            "user_id": user_id,
            "session_id": session_id,
            "session_name": session_name,
            "created_at": now.to_rfc3339(),
            "messages": [],
        });
        let doc_id = format!("{}_{}", user_id, session_id);
        if let Err(e) = self.es.index_doc(&self.conversation_index, doc, Some(&doc_id)).await {
            tracing::warn!("session index write failed (non-fatal): {}", e);
        }

        Ok(session_id)
    }

    /// Cache-first listing; a miss reads active rows and refills the hash.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionMeta>, AppError> {
        if let Some(kv) = &self.kv {
            if let Some(cached) = kv.hgetall(&Self::sessions_key(user_id)) {
                let mut sessions: Vec<SessionMeta> = cached
                    .into_iter()
                    .filter_map(|(session_id, raw)| {
                        let meta: serde_json::Value = serde_json::from_str(&raw).ok()?;
                        Some(SessionMeta {
                            session_id,
                            name: meta["name"].as_str().unwrap_or("对话").to_string(),
                            created_at: meta["created_at"].as_str().unwrap_or_default().to_string(),
                            updated_at: None,
                        })
                    })
                    .collect();
                sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                return Ok(sessions);
            }
        }

        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT session_id, user_id, name, created_at, updated_at FROM sessions \
             WHERE user_id = ? AND is_active = 1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        if let Some(kv) = &self.kv {
            for row in &rows {
                let meta = json!({ "name": row.name, "created_at": row.created_at.to_rfc3339() });
                kv.hset(&Self::sessions_key(user_id), &row.session_id, &meta.to_string());
            }
        }

        Ok(rows
            .into_iter()
            .map(|row| SessionMeta {
                session_id: row.session_id,
                name: row.name,
                created_at: row.created_at.to_rfc3339(),
                updated_at: Some(row.updated_at.to_rfc3339()),
            })
            .collect())
    }

    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionMeta>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT session_id, user_id, name, created_at, updated_at FROM sessions \
             WHERE session_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| SessionMeta {
            session_id: row.session_id,
            name: row.name,
            created_at: row.created_at.to_rfc3339(),
            updated_at: Some(row.updated_at.to_rfc3339()),
        }))
    }

    /// Returns false when the session does not exist (or belongs to
    /// someone else).
    pub async fn rename_session(
        &self,
        user_id: &str,
        session_id: &str,
        name: &str,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET name = ?, updated_at = ? \
             WHERE session_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(name)
        .bind(now)
        .bind(session_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if let Some(kv) = &self.kv {
            let meta = json!({ "name": name, "created_at": now.to_rfc3339() });
            kv.hset(&Self::sessions_key(user_id), session_id, &meta.to_string());
        }
        Ok(true)
    }

    /// Soft delete. Safe to call repeatedly; missing state never raises.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE sessions SET is_active = 0 WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.db)
            .await?;

        if let Some(kv) = &self.kv {
            kv.hdel(&Self::sessions_key(user_id), session_id);
            kv.delete(&Self::messages_key(user_id, session_id));
        }

        let doc_id = format!("{}_{}", user_id, session_id);
        if let Err(e) = self.es.delete_doc(&self.conversation_index, &doc_id).await {
            tracing::warn!("session index delete failed (non-fatal): {}", e);
        }
        tracing::info!("session deleted: user={} session={}", user_id, session_id);
        Ok(())
    }

    /// Bump a session's last-activity timestamp. Best-effort.
    pub async fn touch_session(&self, session_id: &str) {
        let result = sqlx::query("UPDATE sessions SET updated_at = ? WHERE session_id = ?")
            .bind(Utc::now())
            .bind(session_id)
            .execute(&self.db)
            .await;
        if let Err(e) = result {
            tracing::warn!("session touch failed (non-fatal): {}", e);
        }
    }
}
