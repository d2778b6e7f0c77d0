//! Dedup rules and the evaluator contract.
//!
//! Rules arrive as loosely-typed [`DedupRuleConfig`] values and are validated
//! into [`DedupRule`] once, at configuration load time. Signature computation
//! only ever sees validated rules.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
  ConfigError,
  record::{DEFAULT_LANGUAGE, FieldValue, SaveMode, Values},
};

/// Prefix of the index column holding a rule's signatures.
pub const DEDUP_COLUMN_PREFIX: &str = "DEDUP:";

// ─── Rule model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
  #[default]
  Reject,
  Allow,
}

/// Which saves a rule governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
  /// Only final submissions; drafts are never rejected.
  #[default]
  Final,
  /// Drafts and final submissions alike.
  All,
}

/// Conflict message, either a single string or one per language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DedupMessage {
  Plain(String),
  Localized(BTreeMap<String, String>),
}

impl Default for DedupMessage {
  fn default() -> Self {
    DedupMessage::Plain("A matching submission already exists.".to_owned())
  }
}

impl DedupMessage {
  /// Pick the message for `language`, falling back to the default language
  /// and then to any available translation.
  pub fn resolve(&self, language: &str) -> String {
    match self {
      DedupMessage::Plain(s) => s.clone(),
      DedupMessage::Localized(map) => map
        .get(language)
        .or_else(|| map.get(DEFAULT_LANGUAGE))
        .or_else(|| map.values().next())
        .cloned()
        .unwrap_or_else(|| DedupMessage::default().resolve(language)),
    }
  }
}

/// A dedup rule as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRuleConfig {
  pub id:          String,
  #[serde(default)]
  pub keys:        Vec<String>,
  #[serde(default)]
  pub scope:       Option<String>,
  #[serde(default, alias = "on_conflict")]
  pub on_conflict: Option<String>,
  #[serde(default)]
  pub message:     Option<DedupMessage>,
}

/// A validated dedup rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRule {
  pub id:          String,
  pub keys:        Vec<String>,
  pub scope:       DedupScope,
  pub on_conflict: OnConflict,
  pub message:     DedupMessage,
}

impl DedupRule {
  /// Reject-scoped rules are the only ones enforced and indexed.
  pub fn is_active(&self) -> bool { self.on_conflict == OnConflict::Reject }

  pub fn applies_to(&self, mode: SaveMode) -> bool {
    self.scope == DedupScope::All || mode == SaveMode::Final
  }

  /// Header of the index column holding this rule's signatures.
  pub fn column_name(&self) -> String {
    format!("{DEDUP_COLUMN_PREFIX}{}", self.id)
  }
}

impl DedupRule {
  /// Validate one raw rule against the form's declared fields.
  pub fn from_config(
    raw: DedupRuleConfig,
    fields: &[String],
  ) -> Result<Self, ConfigError> {
    let id = raw.id.trim().to_owned();
    if id.is_empty() {
      return Err(ConfigError::EmptyRuleId);
    }
    if id.contains(':') {
      return Err(ConfigError::InvalidRuleId(id));
    }
    if raw.keys.is_empty() {
      return Err(ConfigError::NoKeys(id));
    }

    let mut seen = HashSet::new();
    for key in &raw.keys {
      if !seen.insert(key.as_str()) {
        return Err(ConfigError::DuplicateKey { rule: id, key: key.clone() });
      }
      if !fields.iter().any(|f| f == key) {
        return Err(ConfigError::UnknownKey { rule: id, key: key.clone() });
      }
    }

    let scope = match raw.scope.as_deref().map(str::trim) {
      None | Some("") | Some("final") => DedupScope::Final,
      Some("all") => DedupScope::All,
      Some(other) => {
        return Err(ConfigError::UnknownScope { rule: id, value: other.to_owned() });
      }
    };
    let on_conflict = match raw.on_conflict.as_deref().map(str::trim) {
      None | Some("") | Some("reject") => OnConflict::Reject,
      Some("allow") => OnConflict::Allow,
      Some(other) => {
        return Err(ConfigError::UnknownOnConflict {
          rule:  id,
          value: other.to_owned(),
        });
      }
    };

    Ok(Self {
      id,
      keys: raw.keys,
      scope,
      on_conflict,
      message: raw.message.unwrap_or_default(),
    })
  }
}

/// Validate a form's full rule list. Rule ids must be unique.
pub fn validate_rules(
  raw: Vec<DedupRuleConfig>,
  fields: &[String],
) -> Result<Vec<DedupRule>, ConfigError> {
  let mut ids = HashSet::new();
  let mut rules = Vec::with_capacity(raw.len());
  for r in raw {
    let rule = DedupRule::from_config(r, fields)?;
    if !ids.insert(rule.id.clone()) {
      return Err(ConfigError::DuplicateRuleId(rule.id));
    }
    rules.push(rule);
  }
  Ok(rules)
}

// ─── Evaluator contract ──────────────────────────────────────────────────────

/// A record as seen by the dedup evaluator.
#[derive(Debug, Clone, Default)]
pub struct DedupCandidate {
  pub record_id: Option<String>,
  pub values:    Values,
}

/// Description of the first rule a candidate collides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDescriptor {
  pub rule_id:            String,
  pub message:            String,
  pub existing_record_id: Option<String>,
}

/// Computes rule signatures and detects conflicts among candidates.
pub trait DedupEvaluator: Send + Sync {
  /// Signature of `values` under `rule`; an empty string means the rule does
  /// not apply (some key field is blank).
  fn signature(&self, rule: &DedupRule, values: &Values) -> String;

  /// First conflict between `candidate` and `existing` under the active
  /// rules, if any. Candidates sharing a record id never conflict.
  fn conflict(
    &self,
    rules: &[DedupRule],
    candidate: &DedupCandidate,
    existing: &[DedupCandidate],
    language: &str,
  ) -> Option<ConflictDescriptor>;
}

/// Default evaluator: SHA-256 over the rule id and the case/whitespace
/// normalised key values.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedDedupEvaluator;

impl KeyedDedupEvaluator {
  fn normalize(value: &FieldValue) -> String {
    fn norm(s: &str) -> String {
      s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
    }
    match value {
      FieldValue::Text(s) => norm(s),
      FieldValue::Number(_) | FieldValue::Bool(_) => value.to_cell(),
      FieldValue::List(items) => {
        let mut parts: Vec<String> = items
          .iter()
          .map(|i| norm(i))
          .filter(|i| !i.is_empty())
          .collect();
        parts.sort();
        parts.join("|")
      }
    }
  }
}

impl DedupEvaluator for KeyedDedupEvaluator {
  fn signature(&self, rule: &DedupRule, values: &Values) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule.id.as_bytes());
    for key in &rule.keys {
      let Some(value) = values.get(key).filter(|v| !v.is_blank()) else {
        return String::new();
      };
      hasher.update([0x1f]);
      hasher.update(Self::normalize(value).as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  fn conflict(
    &self,
    rules: &[DedupRule],
    candidate: &DedupCandidate,
    existing: &[DedupCandidate],
    language: &str,
  ) -> Option<ConflictDescriptor> {
    for rule in rules.iter().filter(|r| r.is_active()) {
      let sig = self.signature(rule, &candidate.values);
      if sig.is_empty() {
        continue;
      }
      let hit = existing.iter().find(|other| {
        let same_record = candidate.record_id.is_some()
          && candidate.record_id == other.record_id;
        !same_record && self.signature(rule, &other.values) == sig
      });
      if let Some(other) = hit {
        return Some(ConflictDescriptor {
          rule_id:            rule.id.clone(),
          message:            rule.message.resolve(language),
          existing_record_id: other.record_id.clone(),
        });
      }
    }
    None
  }
}
