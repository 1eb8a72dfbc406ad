//! LLM adapter for OpenAI-compatible chat-completion endpoints.
//!
//! `stream_chat` returns the token deltas as a stream; dropping the stream
//! cancels the upstream call (the reader task dies on its next send and
//! the response body is closed). `complete` collects a single message.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{LlmScenario, LlmSettings};
use crate::error::AppError;
use crate::models::ChatTurn;
use crate::retry::{retry, RetryPolicy};

pub type TokenStream = BoxStream<'static, Result<String, AppError>>;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Single user turn with an optional system prompt, parameterized by a
    /// configured scenario.
    pub fn for_scenario(
        scenario: &LlmScenario,
        system_prompt: Option<&str>,
        user_prompt: &str,
    ) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatTurn::new("system", system));
        }
        messages.push(ChatTurn::new("user", user_prompt));
        ChatRequest {
            messages,
            model: scenario.model.clone(),
            temperature: scenario.temperature,
            max_tokens: scenario.max_tokens,
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Stream assistant deltas. Bounded by `max_tokens`; cancellable by
    /// dropping the returned stream.
    async fn stream_chat(&self, req: ChatRequest) -> Result<TokenStream, AppError>;

    /// Non-streaming completion.
    async fn complete(&self, req: ChatRequest) -> Result<String, AppError>;
}

// ---------------------------------------------------------------------------
// SSE delta parsing
// ---------------------------------------------------------------------------

/// Buffered parser for `data: {json}\n\n` blocks of a chat-completion
/// stream. Emits the text deltas found in `choices[0].delta.content`.
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        SseParser { buffer: String::new() }
    }

    fn parse_line(line: &str, out: &mut Vec<String>) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if let Ok(jv) = serde_json::from_str::<Value>(data) {
            if let Some(text) = jv["choices"][0]["delta"]["content"].as_str() {
                if !text.is_empty() {
                    out.push(text.to_string());
                }
            }
        }
    }

    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();
            for line in block.lines() {
                Self::parse_line(line, &mut out);
            }
        }
        out
    }

    pub(crate) fn flush(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        for line in self.buffer.lines() {
            Self::parse_line(line, &mut out);
        }
        self.buffer.clear();
        out
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings) -> Self {
        LlmClient {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            default_model: settings.model_name.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            retry_policy: RetryPolicy::with_attempts(settings.max_retries),
        }
    }

    pub fn configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        json!({
            "model": req.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, AppError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(AppError::llm_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let transient = status.is_server_error() || status.as_u16() == 429;
            let detail = resp.text().await.unwrap_or_default();
            return Err(AppError::Llm {
                message: format!("upstream returned {}: {}", status, truncate(&detail, 300)),
                transient,
            });
        }
        Ok(resp)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn stream_chat(&self, req: ChatRequest) -> Result<TokenStream, AppError> {
        let body = self.body(&req, true);
        // Connection establishment is retried; an interrupted stream is not.
        let resp = retry(self.retry_policy, "llm.stream_chat", || self.post(&body)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, AppError>>(64);
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            loop {
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for delta in parser.feed(&String::from_utf8_lossy(&chunk)) {
                            if tx.send(Ok(delta)).await.is_err() {
                                // Receiver dropped — cancelled mid-stream.
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(AppError::llm_transport(e))).await;
                        return;
                    }
                    None => {
                        for delta in parser.flush() {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn complete(&self, req: ChatRequest) -> Result<String, AppError> {
        let body = self.body(&req, false);
        let resp = retry(self.retry_policy, "llm.complete", || self.post(&body)).await?;
        let jv: Value = resp.json().await.map_err(AppError::llm_transport)?;
        jv["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::llm("response missing choices[0].message.content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_extracts_deltas_across_chunks() {
        let mut parser = SseParser::new();

        let first = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"等保\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"三级\"}}]}\n");
        assert_eq!(first, vec!["等保".to_string()]);

        // The second block completes on the next chunk boundary.
        let second = parser.feed("\n");
        assert_eq!(second, vec!["三级".to_string()]);
    }

    #[test]
    fn sse_parser_ignores_done_and_garbage() {
        let mut parser = SseParser::new();
        let out = parser.feed("data: [DONE]\n\ndata: not-json\n\n: keepalive\n\n");
        assert!(out.is_empty());
    }

    #[test]
    fn sse_parser_flush_drains_partial_buffer() {
        let mut parser = SseParser::new();
        assert!(parser
            .feed("data: {\"choices\":[{\"delta\":{\"content\":\"尾部\"}}]}")
            .is_empty());
        assert_eq!(parser.flush(), vec!["尾部".to_string()]);
    }

    #[test]
    fn sse_parser_skips_empty_content() {
        let mut parser = SseParser::new();
        let out = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\ndata: {\"choices\":[{\"delta\":{}}]}\n\n");
        assert!(out.is_empty());
    }

    #[test]
    fn chat_request_for_scenario_builds_messages() {
        let scenario = LlmScenario { model: Some("qwen-max".into()), temperature: 0.0, max_tokens: 500 };
        let req = ChatRequest::for_scenario(&scenario, Some("system"), "question");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "question");
        assert_eq!(req.model.as_deref(), Some("qwen-max"));
    }
}
