use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// Message frame types on the streaming wire.
pub const FRAME_THINK: i32 = 1;
pub const FRAME_DATA: i32 = 2;
pub const FRAME_KNOWLEDGE: i32 = 3;
pub const FRAME_ERROR: i32 = 4;

/// A single structured record on the streaming response. Encoded on the
/// wire as `data:{json}\n\n` (no space after the colon).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub content: String,
    pub message_type: i32,
}

impl Frame {
    pub fn think(content: impl Into<String>) -> Self {
        Frame { content: content.into(), message_type: FRAME_THINK }
    }

    pub fn data(content: impl Into<String>) -> Self {
        Frame { content: content.into(), message_type: FRAME_DATA }
    }

    pub fn knowledge(content: impl Into<String>) -> Self {
        Frame { content: content.into(), message_type: FRAME_KNOWLEDGE }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Frame { content: content.into(), message_type: FRAME_ERROR }
    }

    /// Serialize to one wire record.
    pub fn encode(&self) -> String {
        // Frame is a flat {String, i32} struct; serialization cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("data:{}\n\n", json)
    }
}

// ---------------------------------------------------------------------------
// Routing & intent
// ---------------------------------------------------------------------------

/// Which retrieval path serves a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    Graph,
    Text,
    Hybrid,
    None,
}

impl RoutingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingDecision::Graph => "graph",
            RoutingDecision::Text => "text",
            RoutingDecision::Hybrid => "hybrid",
            RoutingDecision::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    GraphQuery,
    TextQuery,
    HybridQuery,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::GraphQuery => "graph_query",
            IntentKind::TextQuery => "text_query",
            IntentKind::HybridQuery => "hybrid_query",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f64,
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeSource {
    Graph,
    Text,
}

impl KnowledgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeSource::Graph => "graph",
            KnowledgeSource::Text => "text",
        }
    }
}

/// One retrieved passage. Ephemeral — lives for the duration of a request.
#[derive(Debug, Clone)]
pub struct Knowledge {
    pub id: String,
    pub title: String,
    pub content: String,
    pub score: f64,
    pub source: KnowledgeSource,
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A single conversational turn, as passed to prompt construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        ChatTurn { role: role.into(), content: content.into() }
    }
}

/// A message as persisted by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// DB row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Chat API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatStreamParams {
    pub session_id: String,
    pub user_id: String,
    /// 1 = hybrid, 2 = graph only, 3 = text only.
    #[serde(default = "default_scene_id")]
    pub scene_id: i32,
}

fn default_scene_id() -> i32 {
    1
}

/// Body of the streaming endpoint. Both `content` and `query` are accepted
/// for compatibility with older clients.
#[derive(Debug, Deserialize)]
pub struct ChatStreamBody {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

impl ChatStreamBody {
    pub fn question(&self) -> Option<&str> {
        self.content
            .as_deref()
            .or(self.query.as_deref())
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    #[serde(default = "default_true")]
    pub enable_knowledge: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct ChatResponseBody {
    pub response: String,
    pub session_id: String,
    pub knowledge_count: usize,
}

// ---------------------------------------------------------------------------
// Session API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionDetailQuery {
    pub user_id: String,
    #[serde(default)]
    pub include_messages: bool,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encodes_wire_format() {
        let frame = Frame::think("<think>\n");
        let wire = frame.encode();
        assert!(wire.starts_with("data:{"));
        assert!(wire.ends_with("\n\n"));

        let json: serde_json::Value =
            serde_json::from_str(wire.trim_start_matches("data:").trim()).unwrap();
        assert_eq!(json["content"], "<think>\n");
        assert_eq!(json["message_type"], 1);
    }

    #[test]
    fn frame_constructors_set_types() {
        assert_eq!(Frame::think("a").message_type, FRAME_THINK);
        assert_eq!(Frame::data("a").message_type, FRAME_DATA);
        assert_eq!(Frame::knowledge("a").message_type, FRAME_KNOWLEDGE);
        assert_eq!(Frame::error("a").message_type, FRAME_ERROR);
    }

    #[test]
    fn stream_body_prefers_content_over_query() {
        let body: ChatStreamBody =
            serde_json::from_str(r#"{"content": "什么是等保三级？", "query": "ignored"}"#).unwrap();
        assert_eq!(body.question(), Some("什么是等保三级？"));

        let body: ChatStreamBody = serde_json::from_str(r#"{"query": "q"}"#).unwrap();
        assert_eq!(body.question(), Some("q"));

        let body: ChatStreamBody = serde_json::from_str(r#"{"content": "  "}"#).unwrap();
        assert_eq!(body.question(), None);
    }

    #[test]
    fn chat_request_defaults() {
        let body: ChatRequestBody =
            serde_json::from_str(r#"{"session_id":"s","user_id":"u","query":"q"}"#).unwrap();
        assert!(body.enable_knowledge);
        assert_eq!(body.top_k, 5);
    }
}
