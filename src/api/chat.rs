//! Chat endpoints: the streaming pipeline and its collected variant.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::error::ApiError;
use crate::models::{
    ChatRequestBody, ChatResponseBody, ChatStreamBody, ChatStreamParams, Frame, FRAME_DATA,
    FRAME_ERROR, FRAME_KNOWLEDGE,
};
use crate::pipeline::{frame_channel, ChatMode, ChatStreamRequest, KNOWLEDGE_CLOSE, KNOWLEDGE_OPEN};
use crate::state::AppState;

/// POST /api/chat/stream?session_id=…&user_id=…&scene_id=…
///
/// Chunked `data:{json}\n\n` records until the pipeline finishes; a
/// single `message_type=4` record signals fatal failure. The response
/// stream is fed by the orchestrator task through a bounded channel, so
/// a disconnecting client unwinds the whole pipeline.
pub async fn chat_stream(
    State(state): State<AppState>,
    Query(params): Query<ChatStreamParams>,
    Json(body): Json<ChatStreamBody>,
) -> Result<Response, ApiError> {
    let question = body
        .question()
        .ok_or_else(|| ApiError::BadRequest("question content is required".into()))?
        .to_string();

    tracing::info!(
        "chat stream: user={} session={} scene={}",
        params.user_id,
        params.session_id,
        params.scene_id
    );

    let request = ChatStreamRequest {
        user_id: params.user_id,
        session_id: params.session_id,
        question,
        mode: ChatMode::from_scene_id(params.scene_id),
        enable_knowledge: true,
        top_k: 0,
    };

    let (sink, rx) = frame_channel(32);
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(orchestrator.run(request, sink));

    let stream = ReceiverStream::new(rx)
        .map(|frame: Frame| Ok::<Bytes, Infallible>(Bytes::from(frame.encode())));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// POST /api/chat/
///
/// Same pipeline as the streaming endpoint (text scene), collected
/// server-side. The response carries the user-facing answer text; think
/// narration and framing markers are dropped.
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }

    let request = ChatStreamRequest {
        user_id: body.user_id.clone(),
        session_id: body.session_id.clone(),
        question: body.query.trim().to_string(),
        mode: ChatMode::TextOnly,
        enable_knowledge: body.enable_knowledge,
        top_k: body.top_k,
    };

    let (sink, mut rx) = frame_channel(32);
    let orchestrator = Arc::clone(&state.orchestrator);
    let run = tokio::spawn(orchestrator.run(request, sink));

    let mut answer = String::new();
    let mut knowledge_count = 0usize;
    let mut error: Option<String> = None;

    while let Some(frame) = rx.recv().await {
        match frame.message_type {
            FRAME_DATA => {
                if !is_data_marker(&frame.content) {
                    answer.push_str(&frame.content);
                }
            }
            FRAME_KNOWLEDGE => {
                if frame.content != KNOWLEDGE_OPEN && frame.content != KNOWLEDGE_CLOSE {
                    knowledge_count += 1;
                }
            }
            FRAME_ERROR => error = Some(frame.content),
            _ => {}
        }
    }
    let _ = run.await;

    if let Some(message) = error {
        return Err(ApiError::Internal(message));
    }

    Ok(Json(ChatResponseBody {
        response: answer.trim().to_string(),
        session_id: body.session_id,
        knowledge_count,
    }))
}

fn is_data_marker(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed == "<data>" || trimmed == "</data>"
}
