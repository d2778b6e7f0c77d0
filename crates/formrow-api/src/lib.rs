//! JSON HTTP API for the formrow engine.
//!
//! Exposes an axum [`Router`] over an [`Engine`] and the configured forms.
//! Auth and TLS are the caller's responsibility.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/forms/{form}/records` | Save; body is a save request |
//! | `GET`  | `/forms/{form}/records` | `?projection=A,B&pageSize=&pageToken=&hydrate=` |
//! | `GET`  | `/forms/{form}/records/{id}` | 404 if not found |
//! | `GET`  | `/forms/{form}/rows/{row}` | Assigns an id to legacy rows |
//! | `POST` | `/forms/{form}/batch` | Page plus specific ids |
//! | `POST` | `/forms/{form}/reconcile` | `{"firstRow", "count", "mode"}` |
//! | `POST` | `/forms/{form}/index/rebuild` | Full index rebuild |
//! | `POST` | `/cache/invalidate` | Retire every cached page and record |

pub mod config;
pub mod error;
pub mod maintenance;
pub mod records;

use std::{collections::BTreeMap, sync::Arc};

use axum::{
  Router,
  routing::{get, post},
};
use formrow_core::form::Form;
use formrow_engine::Engine;
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use error::ApiError;

// ─── Application state ───────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
#[derive(Clone)]
pub struct AppState {
  pub engine: Engine,
  pub forms:  Arc<BTreeMap<String, Arc<Form>>>,
}

impl AppState {
  pub fn new(engine: Engine, forms: impl IntoIterator<Item = Form>) -> Self {
    let forms = forms
      .into_iter()
      .map(|f| (f.form_key.clone(), Arc::new(f)))
      .collect();
    Self { engine, forms: Arc::new(forms) }
  }

  pub fn form(&self, form_key: &str) -> Result<Arc<Form>, ApiError> {
    self
      .forms
      .get(form_key)
      .cloned()
      .ok_or_else(|| formrow_engine::Error::UnknownForm(form_key.to_owned()).into())
  }
}

/// Run a blocking engine call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
  F: FnOnce() -> formrow_engine::Result<T> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| ApiError::Internal(format!("engine task failed: {e}")))?
    .map_err(ApiError::from)
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the API router for `state`.
pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/forms/{form}/records", get(records::list).post(records::save))
    .route("/forms/{form}/records/{id}", get(records::get_one))
    .route("/forms/{form}/rows/{row}", get(records::get_row))
    .route("/forms/{form}/batch", post(records::batch))
    .route("/forms/{form}/reconcile", post(maintenance::reconcile))
    .route("/forms/{form}/index/rebuild", post(maintenance::rebuild_index))
    .route("/cache/invalidate", post(maintenance::invalidate_cache))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
