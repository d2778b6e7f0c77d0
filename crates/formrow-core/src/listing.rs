//! The list and batch read contracts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{FieldValue, Record};

/// Input to `ListingReader::fetch_page`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
  /// Column names to return when not hydrating. Field ids and metadata
  /// headers (e.g. `Status`) are both accepted.
  #[serde(default)]
  pub projection: Vec<String>,
  /// `0` selects the configured default.
  #[serde(default)]
  pub page_size:  usize,
  #[serde(default)]
  pub page_token: Option<String>,
  /// Return full records instead of the projection.
  #[serde(default)]
  pub hydrate:    bool,
}

/// A row read through a projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedRow {
  pub row_number: usize,
  /// Absent for rows written outside this layer that were never assigned
  /// an id.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id:         Option<String>,
  pub values:     BTreeMap<String, FieldValue>,
}

/// A fully decoded row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydratedRow {
  pub row_number: usize,
  #[serde(flatten)]
  pub record:     Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListItem {
  Hydrated(HydratedRow),
  Projected(ProjectedRow),
}

impl ListItem {
  pub fn id(&self) -> Option<&str> {
    match self {
      ListItem::Hydrated(h) => Some(h.record.id.as_str()),
      ListItem::Projected(p) => p.id.as_deref(),
    }
  }

  pub fn row_number(&self) -> usize {
    match self {
      ListItem::Hydrated(h) => h.row_number,
      ListItem::Projected(p) => p.row_number,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
  pub items:           Vec<ListItem>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_page_token: Option<String>,
  pub total_count:     usize,
  pub etag:            String,
}

/// A page plus detail for specific records, fetched in one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
  #[serde(flatten)]
  pub list: ListRequest,
  #[serde(default)]
  pub ids:  Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
  #[serde(flatten)]
  pub page:    ListResponse,
  /// Requested records that were not already part of `page`.
  pub extras:  BTreeMap<String, Record>,
  /// Requested ids that do not exist.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub missing: Vec<String>,
}
