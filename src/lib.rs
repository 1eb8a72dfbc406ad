pub mod api;
pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod store;

use axum::routing::{delete, get, patch, post};
use axum::Router;

use state::AppState;

/// Build the application router with the given state. Extracted from
/// `main()` so integration tests can construct the app without binding a
/// network port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Chat
        .route("/api/chat/stream", post(api::chat::chat_stream))
        .route("/api/chat/", post(api::chat::chat))
        // Sessions
        .route(
            "/api/sessions/",
            post(api::sessions::create_session).get(api::sessions::list_sessions),
        )
        .route(
            "/api/sessions/{session_id}",
            get(api::sessions::get_session).delete(api::sessions::delete_session),
        )
        .route(
            "/api/sessions/{session_id}/rename",
            patch(api::sessions::rename_session),
        )
        .route(
            "/api/sessions/{session_id}/messages",
            delete(api::sessions::clear_session_messages),
        )
        // Health
        .route("/api/health/", get(api::health::health))
        .route("/api/health/detailed", get(api::health::health_detailed))
        .with_state(state)
}
