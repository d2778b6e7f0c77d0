//! Etag generation and the content fingerprint fallback.
//!
//! The normal path never hashes content: an etag is a fresh random token
//! persisted alongside the table shape it was issued for. The fingerprint is
//! only used when that metadata cannot be stored or read.

use chrono::{DateTime, Utc};
use formrow_core::store::{Row, Shape};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Why an etag was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EtagReason {
  Init,
  ShapeChanged,
  Write,
  Reconcile,
  IdAssigned,
  /// Retry of a bump that could not be persisted earlier.
  Recovered,
}

/// Persisted per-resource etag state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtagMetadata {
  pub etag:           String,
  pub last_row_count: usize,
  pub last_col_count: usize,
  pub reason:         EtagReason,
  pub updated_at:     DateTime<Utc>,
}

impl EtagMetadata {
  pub fn issue(shape: Shape, reason: EtagReason) -> Self {
    Self {
      etag: new_etag(),
      last_row_count: shape.rows,
      last_col_count: shape.cols,
      reason,
      updated_at: Utc::now(),
    }
  }

  pub fn matches(&self, shape: Shape) -> bool {
    self.last_row_count == shape.rows && self.last_col_count == shape.cols
  }
}

/// A fresh, unpredictable etag.
pub fn new_etag() -> String { Uuid::new_v4().simple().to_string() }

/// Content fingerprint over the shape plus the given volatile columns.
///
/// Stable: same shape and same volatile cells → same fingerprint.
pub fn fingerprint(shape: Shape, volatile_columns: &[Vec<Row>]) -> String {
  let mut hasher = Sha256::new();
  hasher.update((shape.rows as u64).to_le_bytes());
  hasher.update((shape.cols as u64).to_le_bytes());
  for column in volatile_columns {
    hasher.update([0x1e]);
    for row in column {
      for cell in row {
        hasher.update(cell.as_bytes());
        hasher.update([0x1f]);
      }
    }
  }
  format!("fp-{}", hex::encode(&hasher.finalize()[..16]))
}
