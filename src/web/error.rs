//! Error responses for the HTTP API.

use crate::db::DbError;
use crate::ingest::IngestError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Internal(detail) => {
                tracing::error!("Request failed: {}", detail);
                "Internal Server Error".to_string()
            }
            ApiError::Unauthorized(m) | ApiError::BadRequest(m) | ApiError::NotFound(m) => m,
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound("Not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::NotConfigured => {
                tracing::warn!("Rejecting request: BEACON_API_KEY is not configured");
                ApiError::Unauthorized("Unauthorized".to_string())
            }
            IngestError::Unauthorized => ApiError::Unauthorized("Unauthorized".to_string()),
            IngestError::InvalidPayload(m) => ApiError::BadRequest(m),
            IngestError::Store(db) => db.into(),
        }
    }
}
