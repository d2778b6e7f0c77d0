//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime options for the consistency layer. Every field has a default, so
/// an empty `[engine]` section is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
  /// Bounded wait for the advisory lock before saving lock-less.
  pub lock_timeout_ms:       u64,
  pub page_cache_ttl_secs:   u64,
  pub record_cache_ttl_secs: u64,
  pub max_page_size:         usize,
  pub default_page_size:     usize,
  /// Upper bound on the row range a listing will page through.
  pub max_scan_rows:         usize,
  /// Tables with at most this many data rows are searched by linear scan
  /// instead of the store's find primitive.
  pub linear_scan_threshold: usize,
  /// Terminal statuses; background writes against them are refused.
  pub closed_statuses:       Vec<String>,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      lock_timeout_ms:       3_000,
      page_cache_ttl_secs:   300,
      record_cache_ttl_secs: 600,
      max_page_size:         200,
      default_page_size:     50,
      max_scan_rows:         5_000,
      linear_scan_threshold: 50,
      closed_statuses:       vec!["Closed".to_owned()],
    }
  }
}

impl EngineOptions {
  pub fn lock_timeout(&self) -> Duration { Duration::from_millis(self.lock_timeout_ms) }

  pub fn page_cache_ttl(&self) -> Duration { Duration::from_secs(self.page_cache_ttl_secs) }

  pub fn record_cache_ttl(&self) -> Duration {
    Duration::from_secs(self.record_cache_ttl_secs)
  }

  /// `0` means "use the default"; anything else is clamped to the maximum.
  pub fn clamp_page_size(&self, requested: usize) -> usize {
    let size = if requested == 0 { self.default_page_size } else { requested };
    size.clamp(1, self.max_page_size.max(1))
  }

  pub fn is_closed(&self, status: &str) -> bool {
    self.closed_statuses.iter().any(|s| s.eq_ignore_ascii_case(status))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_defaulted_and_clamped() {
    let opts = EngineOptions::default();
    assert_eq!(opts.clamp_page_size(0), 50);
    assert_eq!(opts.clamp_page_size(7), 7);
    assert_eq!(opts.clamp_page_size(10_000), 200);
  }

  #[test]
  fn closed_status_match_ignores_case() {
    let opts = EngineOptions::default();
    assert!(opts.is_closed("closed"));
    assert!(!opts.is_closed("Submitted"));
  }
}
