//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Engine rejections keep the save-response shape
//! (`{success, message, code, recordId}`) so clients handle every failure
//! the same way; routing-level failures use `{"error": ...}`.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use formrow_engine::Error as EngineError;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error("internal error: {0}")]
  Internal(String),
}

fn engine_status(e: &EngineError) -> StatusCode {
  if e.is_conflict() {
    return StatusCode::CONFLICT;
  }
  match e {
    EngineError::IndexNotBuilt { .. } | EngineError::Transient(_) => {
      StatusCode::SERVICE_UNAVAILABLE
    }
    EngineError::UnknownForm(_) => StatusCode::NOT_FOUND,
    EngineError::LayoutMismatch { .. } | EngineError::AlignmentViolation { .. } => {
      StatusCode::INTERNAL_SERVER_ERROR
    }
    _ => StatusCode::BAD_REQUEST,
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
      ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": m })),
      ApiError::Engine(e) => (engine_status(e), json!(e.to_response())),
    };
    if status.is_server_error() {
      tracing::error!(%status, error = %self, "request failed");
    }
    (status, Json(body)).into_response()
  }
}
