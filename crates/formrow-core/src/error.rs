//! Error types for `formrow-core`.

use thiserror::Error;

/// Failure reported by a collaborator backend (tabular store, cache,
/// property store or lock).
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("table not found: {0}")]
  TableNotFound(String),

  #[error("table already exists: {0}")]
  TableExists(String),

  #[error("invalid range: {0}")]
  InvalidRange(String),

  #[error("backend unavailable: {0}")]
  Unavailable(String),

  #[error("backend error: {0}")]
  Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A form or dedup rule rejected while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("form has an empty form key")]
  EmptyFormKey,

  #[error("form {0:?} has an empty destination table")]
  EmptyDestination(String),

  #[error("form {form:?} declares field {field:?} more than once")]
  DuplicateField { form: String, field: String },

  #[error("form {form:?} declares reserved field name {field:?}")]
  ReservedField { form: String, field: String },

  #[error("dedup rule has an empty id")]
  EmptyRuleId,

  #[error("dedup rule id {0:?} must not contain ':'")]
  InvalidRuleId(String),

  #[error("dedup rule id {0:?} is declared more than once")]
  DuplicateRuleId(String),

  #[error("dedup rule {0:?} has no keys")]
  NoKeys(String),

  #[error("dedup rule {rule:?} repeats key {key:?}")]
  DuplicateKey { rule: String, key: String },

  #[error("dedup rule {rule:?} references undeclared field {key:?}")]
  UnknownKey { rule: String, key: String },

  #[error("dedup rule {rule:?} has unknown scope {value:?}")]
  UnknownScope { rule: String, value: String },

  #[error("dedup rule {rule:?} has unknown onConflict {value:?}")]
  UnknownOnConflict { rule: String, value: String },
}
