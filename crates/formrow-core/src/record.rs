//! Records, field values, and the save request/response contract.
//!
//! A record is one form submission stored as one row of a destination table.
//! Field values are scalars or string lists; on the wire they are plain JSON
//! (`"Soup"`, `3`, `true`, `["a","b"]`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status assigned to records saved in draft mode.
pub const DRAFT_STATUS: &str = "Draft";

/// Status assigned to new records saved in final mode.
pub const SUBMITTED_STATUS: &str = "Submitted";

/// Language used when a request does not name one.
pub const DEFAULT_LANGUAGE: &str = "en";

// ─── Field values ────────────────────────────────────────────────────────────

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Bool(bool),
  Number(f64),
  Text(String),
  List(Vec<String>),
}

/// Field id → value.
pub type Values = BTreeMap<String, FieldValue>;

impl FieldValue {
  /// Render the value as the text stored in a table cell.
  ///
  /// Lists are stored as a JSON array so they survive a round trip; every
  /// other value is stored as its plain text form.
  pub fn to_cell(&self) -> String {
    match self {
      FieldValue::Bool(b) => b.to_string(),
      FieldValue::Number(n) => format_number(*n),
      FieldValue::Text(s) => s.clone(),
      FieldValue::List(items) => serde_json::Value::from(items.clone()).to_string(),
    }
  }

  /// Parse a stored cell. Blank cells carry no value.
  pub fn from_cell(cell: &str) -> Option<Self> {
    if cell.is_empty() {
      return None;
    }
    if cell.starts_with('[')
      && let Ok(items) = serde_json::from_str::<Vec<String>>(cell)
    {
      return Some(FieldValue::List(items));
    }
    Some(FieldValue::Text(cell.to_owned()))
  }

  /// `true` when the value contributes nothing (empty text, empty list).
  pub fn is_blank(&self) -> bool {
    match self {
      FieldValue::Text(s) => s.trim().is_empty(),
      FieldValue::List(items) => items.iter().all(|i| i.trim().is_empty()),
      FieldValue::Bool(_) | FieldValue::Number(_) => false,
    }
  }
}

fn format_number(n: f64) -> String {
  if n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{}", n as i64)
  } else {
    n.to_string()
  }
}

impl From<&str> for FieldValue {
  fn from(s: &str) -> Self { FieldValue::Text(s.to_owned()) }
}

impl From<String> for FieldValue {
  fn from(s: String) -> Self { FieldValue::Text(s) }
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// A stored form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
  pub id:           String,
  pub form_key:     String,
  pub language:     String,
  pub values:       Values,
  pub status:       String,
  pub created_at:   DateTime<Utc>,
  pub updated_at:   DateTime<Utc>,
  pub data_version: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pdf_url:      Option<String>,
}

// ─── Save request ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
  #[default]
  Final,
  Draft,
}

impl SaveMode {
  /// The mode a stored record was last saved under, judged by its status.
  pub fn for_status(status: &str) -> Self {
    if status == DRAFT_STATUS { SaveMode::Draft } else { SaveMode::Final }
  }
}

/// Who is performing the write. Background writes are refused against
/// closed records unless explicitly allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOrigin {
  #[default]
  Interactive,
  Background,
}

/// Input to `SubmissionStore::save`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
  /// Absent for new records.
  #[serde(default)]
  pub record_id:               Option<String>,
  /// May be left out when the route already names the form.
  #[serde(default)]
  pub form_key:                String,
  #[serde(default = "default_language")]
  pub language:                String,
  #[serde(default)]
  pub values:                  Values,
  /// The `dataVersion` the caller last observed; enables the stale check.
  #[serde(default)]
  pub client_observed_version: Option<u64>,
  #[serde(default)]
  pub save_mode:               SaveMode,
  #[serde(default)]
  pub status_override:         Option<String>,
  #[serde(default)]
  pub origin:                  WriteOrigin,
  #[serde(default)]
  pub allow_closed:            bool,
  #[serde(default)]
  pub pdf_url:                 Option<String>,
}

fn default_language() -> String { DEFAULT_LANGUAGE.to_owned() }

impl SaveRequest {
  pub fn new(form_key: impl Into<String>, values: Values) -> Self {
    Self {
      form_key: form_key.into(),
      language: default_language(),
      values,
      ..Self::default()
    }
  }

  pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
    self.record_id = Some(id.into());
    self
  }

  pub fn with_observed_version(mut self, version: u64) -> Self {
    self.client_observed_version = Some(version);
    self
  }
}

// ─── Save response ───────────────────────────────────────────────────────────

/// Metadata describing the row a save landed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
  pub id:           String,
  pub created_at:   DateTime<Utc>,
  pub updated_at:   DateTime<Utc>,
  pub data_version: u64,
  pub row_number:   usize,
}

/// Which best-effort maintenance step failed after the authoritative write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceStage {
  Index,
  Cache,
}

/// A swallowed index/cache failure, surfaced for observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceIssue {
  pub stage:  MaintenanceStage,
  pub detail: String,
}

impl MaintenanceIssue {
  pub fn index(detail: impl std::fmt::Display) -> Self {
    Self { stage: MaintenanceStage::Index, detail: detail.to_string() }
  }

  pub fn cache(detail: impl std::fmt::Display) -> Self {
    Self { stage: MaintenanceStage::Cache, detail: detail.to_string() }
  }
}

/// Wire shape returned for every save, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
  pub success:   bool,
  pub message:   String,
  /// Machine-readable rejection code; absent on success.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code:      Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub record_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta:      Option<RecordMeta>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub warnings:  Vec<MaintenanceIssue>,
}

impl SaveResponse {
  pub fn rejected(
    code: impl Into<String>,
    message: impl Into<String>,
    record_id: Option<String>,
  ) -> Self {
    Self {
      success: false,
      message: message.into(),
      code: Some(code.into()),
      record_id,
      meta: None,
      warnings: Vec::new(),
    }
  }
}
