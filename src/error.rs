use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("failed to encode raw payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event store connection lock poisoned")]
    Poisoned,
    #[error("event store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures surfaced to webhook and read API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid webhook payload")]
    InvalidPayload,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidPayload => (StatusCode::BAD_REQUEST, "Invalid webhook payload"),
            Self::Store(err) => {
                error!("Event store failure: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
