//! Handlers for reconciliation, index rebuilds and cache invalidation.
//!
//! Meant to be called by whatever notices direct edits to a table: an edit
//! hook, a scheduler or an operator.

use axum::{
  Json,
  extract::{Path, State},
};
use formrow_engine::{ReconcileMode, ReconcileReport};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{AppState, blocking, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileBody {
  pub first_row: usize,
  #[serde(default = "one")]
  pub count:     usize,
  #[serde(default = "edited")]
  pub mode:      ReconcileMode,
}

fn one() -> usize { 1 }

fn edited() -> ReconcileMode { ReconcileMode::Edited }

/// `POST /forms/{form}/reconcile`
pub async fn reconcile(
  State(state): State<AppState>,
  Path(form_key): Path<String>,
  Json(body): Json<ReconcileBody>,
) -> Result<Json<ReconcileReport>, ApiError> {
  let form = state.form(&form_key)?;
  let engine = state.engine.clone();
  let report = blocking(move || {
    engine
      .reconciler()
      .reconcile_rows(&form, body.first_row, body.count, body.mode)
  })
  .await?;
  Ok(Json(report))
}

/// `POST /forms/{form}/index/rebuild`
pub async fn rebuild_index(
  State(state): State<AppState>,
  Path(form_key): Path<String>,
) -> Result<Json<ReconcileReport>, ApiError> {
  let form = state.form(&form_key)?;
  let engine = state.engine.clone();
  let report = blocking(move || engine.reconciler().rebuild_index(&form)).await?;
  Ok(Json(report))
}

/// `POST /cache/invalidate`
///
/// Retires every cached page and record across all forms.
pub async fn invalidate_cache(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
  let engine = state.engine.clone();
  let version = blocking(move || Ok(engine.cache().invalidate_all("requested over the api")))
    .await?
    .map_err(|issue| ApiError::Internal(format!("cache not invalidated: {}", issue.detail)))?;
  Ok(Json(json!({ "version": version })))
}
