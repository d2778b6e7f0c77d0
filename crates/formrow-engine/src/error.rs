//! Error type for `formrow-engine`.
//!
//! The first five variants are the rejection taxonomy callers act on; the
//! rest describe malformed requests or broken invariants.

use formrow_core::{StoreError, page::PageTokenError, record::SaveResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// The caller's observed version is older than the stored one.
  #[error(
    "record {record_id} was changed by someone else (stored version {stored}, \
     you had {observed}); refresh and try again"
  )]
  StaleWrite { record_id: String, stored: u64, observed: u64 },

  /// A reject-scoped dedup rule matched another record.
  #[error("{message}")]
  Duplicate {
    rule_id:            String,
    message:            String,
    record_id:          Option<String>,
    existing_record_id: String,
  },

  /// Dedup cannot be trusted because the index does not cover the table.
  #[error(
    "the record index for table {table:?} is missing or out of date; \
     rebuild the index before saving"
  )]
  IndexNotBuilt { table: String, record_id: Option<String> },

  /// Background write against a record in a terminal status.
  #[error("record {record_id} is {status} and cannot be changed")]
  ClosedRecord { record_id: String, status: String },

  /// The authoritative write (or a read it depends on) failed.
  #[error("store error: {0}")]
  Transient(#[from] StoreError),

  #[error("unknown form: {0}")]
  UnknownForm(String),

  #[error("field {field:?} is not declared by form {form:?}")]
  UnknownField { form: String, field: String },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("invalid page token: {0}")]
  InvalidPageToken(#[from] PageTokenError),

  #[error("table {table:?} has an unexpected header: {detail}")]
  LayoutMismatch { table: String, detail: String },

  #[error(
    "index row {row} names {found:?} but the table row holds {expected:?}"
  )]
  AlignmentViolation { row: usize, expected: String, found: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// Stable machine-readable code.
  pub fn code(&self) -> &'static str {
    match self {
      Error::StaleWrite { .. } => "stale_write",
      Error::Duplicate { .. } => "duplicate",
      Error::IndexNotBuilt { .. } => "index_not_built",
      Error::ClosedRecord { .. } => "closed_record",
      Error::Transient(_) => "transient",
      Error::UnknownForm(_) => "unknown_form",
      Error::UnknownField { .. } => "unknown_field",
      Error::InvalidRequest(_) => "invalid_request",
      Error::InvalidPageToken(_) => "invalid_page_token",
      Error::LayoutMismatch { .. } => "layout_mismatch",
      Error::AlignmentViolation { .. } => "alignment_violation",
    }
  }

  /// The record the failure concerns, when known.
  pub fn record_id(&self) -> Option<&str> {
    match self {
      Error::StaleWrite { record_id, .. }
      | Error::ClosedRecord { record_id, .. } => Some(record_id),
      Error::Duplicate { record_id, .. }
      | Error::IndexNotBuilt { record_id, .. } => record_id.as_deref(),
      _ => None,
    }
  }

  /// `true` for rejections a client can resolve by refreshing or editing.
  pub fn is_conflict(&self) -> bool {
    matches!(
      self,
      Error::StaleWrite { .. } | Error::Duplicate { .. } | Error::ClosedRecord { .. }
    )
  }

  /// Render as the save wire response.
  pub fn to_response(&self) -> SaveResponse {
    SaveResponse::rejected(
      self.code(),
      self.to_string(),
      self.record_id().map(str::to_owned),
    )
  }
}
