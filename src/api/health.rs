//! Health endpoints: liveness plus per-backend readiness.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::models::HealthResponse;
use crate::state::AppState;

pub const APP_NAME: &str = "RegSage";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /api/health/
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: APP_VERSION.to_string(),
        app: APP_NAME.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// GET /api/health/detailed
///
/// Probes each backend. The service reports "degraded" rather than
/// failing the endpoint when a dependency is down.
pub async fn health_detailed(State(state): State<AppState>) -> Json<Value> {
    let row_store = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let text_index = state.es.ping().await;
    let graph_engine = if state.settings.neo4j.enabled {
        if state.graph.ping().await {
            "ok"
        } else {
            "error"
        }
    } else {
        "disabled"
    };
    let cache = match &state.kv {
        Some(kv) => {
            if kv.ping() {
                "ok"
            } else {
                "error"
            }
        }
        None => "disabled",
    };
    let llm = if state.llm_configured { "ok" } else { "unconfigured" };

    let healthy = row_store && text_index;
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": APP_VERSION,
        "app": APP_NAME,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "backends": {
            "row_store": if row_store { "ok" } else { "error" },
            "text_index": if text_index { "ok" } else { "error" },
            "graph_engine": graph_engine,
            "cache": cache,
            "llm": llm,
        }
    }))
}
