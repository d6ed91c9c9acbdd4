use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failure taxonomy for the progression engine. None of these are fatal to
/// the process: every variant degrades to a blocked or unchanged state.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A remote call failed or returned non-2xx. The operation is abandoned
    /// without mutating completion state.
    #[error("remote call failed: {0}")]
    Network(String),

    /// The similarity-scoring service failed. Scoring degrades to 0 points
    /// for the affected question instead of aborting the submission.
    #[error("similarity scoring failed: {0}")]
    ScoringService(String),

    /// Missing or unknown session: treated as "no user", all gated content
    /// reported inaccessible.
    #[error("invalid or missing session")]
    InvalidSession,

    /// An unlock rule refused access. Carries the user-visible message.
    #[error("{0}")]
    Locked(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl EngineError {
    fn status(&self) -> StatusCode {
        match self {
            EngineError::Network(_) => StatusCode::BAD_GATEWAY,
            EngineError::ScoringService(_) => StatusCode::BAD_GATEWAY,
            EngineError::InvalidSession => StatusCode::UNAUTHORIZED,
            EngineError::Locked(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error=%self, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
