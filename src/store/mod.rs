//! Session & message store.
//!
//! Three tiers: the in-process cache (fast, 24 h TTL, optional), the row
//! store (authoritative for sessions) and the search index (authoritative
//! for message content). Writes go through the primary tier and treat the
//! secondary tiers as best-effort; reads go cache-first and refill on miss.

mod messages;
mod sessions;

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::clients::{KvStore, TextIndex};
use crate::error::AppError;
use crate::models::StoredMessage;

/// Messages cached per `(user, session)` expire after a day and refill
/// from the search index on the next read.
pub(crate) const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// The persistence seam the orchestrator depends on; stubbed in tests.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), AppError>;

    async fn get_messages(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, AppError>;
}

pub struct SessionStore {
    pub(crate) db: MySqlPool,
    pub(crate) kv: Option<Arc<KvStore>>,
    pub(crate) es: Arc<dyn TextIndex>,
    pub(crate) conversation_index: String,
    /// Keeps message ids strictly increasing even when two appends land in
    /// the same millisecond.
    pub(crate) last_message_ms: AtomicI64,
}

impl SessionStore {
    pub fn new(
        db: MySqlPool,
        kv: Option<Arc<KvStore>>,
        es: Arc<dyn TextIndex>,
        conversation_index: impl Into<String>,
    ) -> Self {
        SessionStore {
            db,
            kv,
            es,
            conversation_index: conversation_index.into(),
            last_message_ms: AtomicI64::new(0),
        }
    }

    pub(crate) fn sessions_key(user_id: &str) -> String {
        format!("sessions:{}", user_id)
    }

    pub(crate) fn messages_key(user_id: &str, session_id: &str) -> String {
        format!("messages:{}:{}", user_id, session_id)
    }
}

#[async_trait]
impl MessageStore for SessionStore {
    async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), AppError> {
        SessionStore::append_message(self, user_id, session_id, role, content).await
    }

    async fn get_messages(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, AppError> {
        SessionStore::get_messages(self, user_id, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_layout() {
        assert_eq!(SessionStore::sessions_key("u1"), "sessions:u1");
        assert_eq!(SessionStore::messages_key("u1", "s1"), "messages:u1:s1");
    }
}
