//! Error types.
//!
//! `AppError` is the internal error enum shared by adapters, stores and the
//! pipeline; variants carry a `transient` flag where retry eligibility
//! matters. `ApiError` is the HTTP-facing error: full detail is logged
//! server-side, the client receives a sanitized JSON body.

use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("row store error: {0}")]
    RowStore(#[from] sqlx::Error),

    #[error("text index error: {message}")]
    TextIndex { message: String, transient: bool },

    #[error("graph engine error: {message}")]
    GraphEngine { message: String, transient: bool },

    #[error("embedding error: {message}")]
    Embedding { message: String, transient: bool },

    #[error("llm error: {message}")]
    Llm { message: String, transient: bool },

    #[error("intent parse error: {0}")]
    IntentParse(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),
}

impl AppError {
    pub fn llm(message: impl Into<String>) -> Self {
        AppError::Llm {
            message: message.into(),
            transient: false,
        }
    }

    pub fn llm_transport(e: reqwest::Error) -> Self {
        AppError::Llm {
            message: e.to_string(),
            transient: e.is_timeout() || e.is_connect(),
        }
    }

    pub fn text_index(message: impl Into<String>, transient: bool) -> Self {
        AppError::TextIndex {
            message: message.into(),
            transient,
        }
    }

    pub fn graph_engine(message: impl Into<String>, transient: bool) -> Self {
        AppError::GraphEngine {
            message: message.into(),
            transient,
        }
    }

    pub fn embedding(message: impl Into<String>, transient: bool) -> Self {
        AppError::Embedding {
            message: message.into(),
            transient,
        }
    }

    /// Whether a retry may succeed. Only network/timeout class failures
    /// qualify; parse and logic errors abort immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TextIndex { transient, .. }
            | AppError::GraphEngine { transient, .. }
            | AppError::Embedding { transient, .. }
            | AppError::Llm { transient, .. } => *transient,
            AppError::RowStore(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP-facing error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Sanitized message safe to return to clients. Internal errors never
    /// leak detail; the rest pass their message through.
    fn sanitized_message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::NotFound(m) => m.clone(),
            ApiError::Internal(_) => "Internal server error".to_string(),
            ApiError::Unavailable(m) => m.clone(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        tracing::error!(code = self.error_code(), "API error ({}): {}", status.as_u16(), self);
        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.sanitized_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::Config(m) => ApiError::Unavailable(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeouty = AppError::Llm {
            message: "timed out".into(),
            transient: true,
        };
        assert!(timeouty.is_transient());

        assert!(!AppError::llm("boom").is_transient());
        assert!(!AppError::IntentParse("bad label".into()).is_transient());
        assert!(!AppError::Config("missing".into()).is_transient());
    }

    #[test]
    fn api_error_maps_status() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let e = ApiError::Internal("password=hunter2 exploded".into());
        assert_eq!(e.sanitized_message(), "Internal server error");
    }
}
