//! Session management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::{CreateSessionRequest, RenameSessionRequest, SessionDetailQuery, UserQuery};
use crate::state::AppState;

/// POST /api/sessions/
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }

    let session_id = state
        .store
        .create_session(&req.user_id, req.name.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "session_id": session_id }))))
}

/// GET /api/sessions/?user_id=…
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state.store.list_sessions(&query.user_id).await?;
    let count = sessions.len();
    Ok(Json(json!({ "sessions": sessions, "count": count })))
}

/// GET /api/sessions/{session_id}?user_id=…&include_messages=…
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionDetailQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .get_session(&query.user_id, &session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {} not found", session_id)))?;

    let mut body = serde_json::to_value(&session).map_err(|e| ApiError::Internal(e.to_string()))?;
    if query.include_messages {
        let messages = state.store.get_messages(&query.user_id, &session_id).await?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("messages".into(), json!(messages));
        }
    }
    Ok(Json(body))
}

/// PATCH /api/sessions/{session_id}/rename
pub async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }

    let renamed = state
        .store
        .rename_session(&req.user_id, &session_id, req.name.trim())
        .await?;
    if !renamed {
        return Err(ApiError::NotFound(format!("session {} not found", session_id)));
    }
    Ok(Json(json!({ "session_id": session_id, "name": req.name.trim() })))
}

/// DELETE /api/sessions/{session_id}?user_id=…
///
/// Idempotent — deleting an unknown or already-deleted session succeeds.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_session(&query.user_id, &session_id).await?;
    Ok(Json(json!({ "status": "deleted", "session_id": session_id })))
}

/// DELETE /api/sessions/{session_id}/messages?user_id=…
pub async fn clear_session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .clear_messages(&query.user_id, &session_id)
        .await?;
    Ok(Json(json!({ "status": "cleared", "session_id": session_id })))
}
