//! Error type for `formrow-store-sqlite`.

use formrow_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("connection mutex poisoned")]
  Poisoned,

  #[error("table not found: {0}")]
  TableNotFound(String),

  #[error("table already exists: {0}")]
  TableExists(String),

  #[error("invalid range: {0}")]
  InvalidRange(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for StoreError {
  fn from(e: Error) -> Self {
    match e {
      Error::TableNotFound(t) => StoreError::TableNotFound(t),
      Error::TableExists(t) => StoreError::TableExists(t),
      Error::InvalidRange(r) => StoreError::InvalidRange(r),
      Error::Poisoned => StoreError::Unavailable(e.to_string()),
      Error::Database(_) => StoreError::Backend(Box::new(e)),
    }
  }
}
