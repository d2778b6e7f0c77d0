//! Form configuration: which table a form writes to, which fields it
//! declares, and which dedup rules govern it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
  ConfigError,
  dedup::{DedupRule, DedupRuleConfig, validate_rules},
};

/// Header names of the metadata columns that lead every destination table,
/// in physical order.
pub const META_COLUMNS: [&str; 8] = [
  "Record ID",
  "Form Key",
  "Language",
  "Status",
  "Created At",
  "Updated At",
  "Data Version",
  "PDF URL",
];

/// A form as written in configuration. TOML files may use snake_case keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
  #[serde(alias = "form_key")]
  pub form_key:    String,
  /// Name of the main table records are stored in.
  pub destination: String,
  #[serde(default)]
  pub fields:      Vec<String>,
  #[serde(default, alias = "dedup_rules")]
  pub dedup_rules: Vec<DedupRuleConfig>,
}

/// A validated form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
  pub form_key:    String,
  pub destination: String,
  pub fields:      Vec<String>,
  pub rules:       Vec<DedupRule>,
}

impl Form {
  /// Rules that are enforced and get an index column.
  pub fn active_rules(&self) -> impl Iterator<Item = &DedupRule> {
    self.rules.iter().filter(|r| r.is_active())
  }

  pub fn declares(&self, field: &str) -> bool {
    self.fields.iter().any(|f| f == field)
  }
}

impl TryFrom<FormConfig> for Form {
  type Error = ConfigError;

  fn try_from(raw: FormConfig) -> Result<Self, ConfigError> {
    let form_key = raw.form_key.trim().to_owned();
    if form_key.is_empty() {
      return Err(ConfigError::EmptyFormKey);
    }
    let destination = raw.destination.trim().to_owned();
    if destination.is_empty() {
      return Err(ConfigError::EmptyDestination(form_key));
    }

    let mut seen = HashSet::new();
    for field in &raw.fields {
      if META_COLUMNS.contains(&field.as_str()) {
        return Err(ConfigError::ReservedField {
          form:  form_key,
          field: field.clone(),
        });
      }
      if !seen.insert(field.as_str()) {
        return Err(ConfigError::DuplicateField {
          form:  form_key,
          field: field.clone(),
        });
      }
    }

    let rules = validate_rules(raw.dedup_rules, &raw.fields)?;
    Ok(Self { form_key, destination, fields: raw.fields, rules })
  }
}
