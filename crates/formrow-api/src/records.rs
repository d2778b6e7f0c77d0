//! Handlers for `/forms/{form}/records`, `/rows` and `/batch`.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use formrow_core::{
  listing::{BatchRequest, BatchResponse, HydratedRow, ListRequest, ListResponse},
  record::{Record, SaveRequest},
};
use serde::Deserialize;

use crate::{AppState, blocking, error::ApiError};

// ─── Save ────────────────────────────────────────────────────────────────────

/// `POST /forms/{form}/records`. 201 when a record was created.
pub async fn save(
  State(state): State<AppState>,
  Path(form_key): Path<String>,
  Json(mut request): Json<SaveRequest>,
) -> Result<impl IntoResponse, ApiError> {
  let form = state.form(&form_key)?;
  if request.form_key.is_empty() {
    request.form_key = form_key;
  }
  let engine = state.engine.clone();
  let receipt = blocking(move || engine.submissions().save(&form, request)).await?;
  let status = if receipt.created { StatusCode::CREATED } else { StatusCode::OK };
  Ok((status, Json(receipt.into_response())))
}

// ─── List ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
  /// Comma-separated column names.
  pub projection: Option<String>,
  pub page_size:  Option<usize>,
  pub page_token: Option<String>,
  #[serde(default)]
  pub hydrate:    bool,
}

impl From<ListParams> for ListRequest {
  fn from(p: ListParams) -> Self {
    ListRequest {
      projection: p
        .projection
        .map(|s| {
          s.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect()
        })
        .unwrap_or_default(),
      page_size:  p.page_size.unwrap_or(0),
      page_token: p.page_token,
      hydrate:    p.hydrate,
    }
  }
}

/// `GET /forms/{form}/records`
pub async fn list(
  State(state): State<AppState>,
  Path(form_key): Path<String>,
  Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
  let form = state.form(&form_key)?;
  let request = ListRequest::from(params);
  let engine = state.engine.clone();
  let page = blocking(move || engine.listing().fetch_page(&form, &request)).await?;
  Ok(Json(page))
}

// ─── Get one ─────────────────────────────────────────────────────────────────

/// `GET /forms/{form}/records/{id}`
pub async fn get_one(
  State(state): State<AppState>,
  Path((form_key, id)): Path<(String, String)>,
) -> Result<Json<Record>, ApiError> {
  let form = state.form(&form_key)?;
  let engine = state.engine.clone();
  let lookup = id.clone();
  blocking(move || engine.listing().fetch_by_id(&form, &lookup))
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("record {id} not found")))
}

/// `GET /forms/{form}/rows/{row}`
pub async fn get_row(
  State(state): State<AppState>,
  Path((form_key, row)): Path<(String, usize)>,
) -> Result<Json<HydratedRow>, ApiError> {
  let form = state.form(&form_key)?;
  let engine = state.engine.clone();
  blocking(move || engine.listing().fetch_by_row_number(&form, row))
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("row {row} holds no record")))
}

// ─── Batch ───────────────────────────────────────────────────────────────────

/// `POST /forms/{form}/batch`
pub async fn batch(
  State(state): State<AppState>,
  Path(form_key): Path<String>,
  Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
  let form = state.form(&form_key)?;
  let engine = state.engine.clone();
  let response = blocking(move || engine.listing().fetch_batch(&form, &request)).await?;
  Ok(Json(response))
}
