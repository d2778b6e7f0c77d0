//! [`CacheStore`]: namespaced TTL cache plus per-table etag metadata.
//!
//! The cache is never a correctness dependency: read failures are misses and
//! write failures come back as [`MaintenanceIssue`]s. Cache keys always embed
//! the table's current etag, so bumping the etag retires every entry for that
//! table, and rotating the namespace version retires everything at once.
//!
//! A table whose last bump could not be persisted is unsettled: its stored
//! etag still names entries written before the change, so reads use the
//! content fingerprint instead until a bump goes through.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use formrow_core::{
  record::MaintenanceIssue,
  store::{KvCache, PropertyStore, Shape, TabularStore},
};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{
  etag::{EtagMetadata, EtagReason, fingerprint, new_etag},
  layout::{COL_DATA_VERSION, COL_ID, COL_UPDATED_AT, FIRST_DATA_ROW},
};

const ETAG_PROPERTY_PREFIX: &str = "etag:";
const CACHE_VERSION_PROPERTY: &str = "cache:version";

// Longer keys are replaced by their digest.
const MAX_KEY_LEN: usize = 200;

/// Columns hashed by the fingerprint fallback.
const VOLATILE_COLUMNS: [usize; 3] = [COL_ID, COL_UPDATED_AT, COL_DATA_VERSION];

#[derive(Clone)]
pub struct CacheStore {
  tables:     Arc<dyn TabularStore>,
  cache:      Arc<dyn KvCache>,
  properties: Arc<dyn PropertyStore>,
  unsettled:  Arc<Mutex<HashSet<String>>>,
}

impl CacheStore {
  pub fn new(
    tables: Arc<dyn TabularStore>,
    cache: Arc<dyn KvCache>,
    properties: Arc<dyn PropertyStore>,
  ) -> Self {
    Self { tables, cache, properties, unsettled: Arc::default() }
  }

  // ── Etags ────────────────────────────────────────────────────────────────

  /// Current etag of `resource`, issuing one if none is stored or the stored
  /// one was issued for a different shape. Never reads cell contents unless
  /// the property store is unavailable.
  pub fn get_or_init_etag(&self, resource: &str, shape: Shape) -> String {
    if self.is_unsettled(resource) {
      return match self.bump(resource, EtagReason::Recovered) {
        Ok(etag) => etag,
        Err(_) => self.fingerprint(resource, shape),
      };
    }
    let key = etag_property(resource);
    let reason = match self.properties.get(&key) {
      Ok(Some(raw)) => match serde_json::from_str::<EtagMetadata>(&raw) {
        Ok(meta) if meta.matches(shape) => return meta.etag,
        Ok(_) => EtagReason::ShapeChanged,
        Err(e) => {
          tracing::warn!(resource, error = %e, "discarding unreadable etag metadata");
          EtagReason::Init
        }
      },
      Ok(None) => EtagReason::Init,
      Err(e) => {
        tracing::warn!(resource, error = %e, "etag metadata unavailable, fingerprinting");
        return self.fingerprint(resource, shape);
      }
    };

    let meta = EtagMetadata::issue(shape, reason);
    match self.persist(&key, &meta) {
      Ok(()) => {
        tracing::debug!(resource, ?reason, etag = %meta.etag, "issued etag");
        meta.etag
      }
      Err(issue) => {
        tracing::warn!(resource, detail = %issue.detail, "etag not persisted, fingerprinting");
        self.fingerprint(resource, shape)
      }
    }
  }

  /// Etag of `resource` as readers will see it now, if its shape is
  /// readable.
  pub fn current_etag(&self, resource: &str) -> Option<String> {
    let shape = self.tables.shape(resource).ok()?;
    Some(self.get_or_init_etag(resource, shape))
  }

  /// Issue and persist a new etag for `resource` unconditionally. On failure
  /// the resource stays unsettled until a later bump succeeds.
  pub fn bump(&self, resource: &str, reason: EtagReason) -> Result<String, MaintenanceIssue> {
    let bumped = self
      .tables
      .shape(resource)
      .map_err(|e| MaintenanceIssue::cache(format!("cannot read shape of {resource}: {e}")))
      .and_then(|shape| {
        let meta = EtagMetadata::issue(shape, reason);
        self.persist(&etag_property(resource), &meta)?;
        Ok(meta.etag)
      });
    let mut unsettled = self.unsettled.lock().unwrap_or_else(PoisonError::into_inner);
    match &bumped {
      Ok(etag) => {
        unsettled.remove(resource);
        tracing::info!(resource, ?reason, etag = %etag, "bumped etag");
      }
      Err(issue) => {
        unsettled.insert(resource.to_owned());
        tracing::warn!(resource, ?reason, detail = %issue.detail, "etag bump not persisted");
      }
    }
    bumped
  }

  fn is_unsettled(&self, resource: &str) -> bool {
    self
      .unsettled
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(resource)
  }

  fn persist(&self, key: &str, meta: &EtagMetadata) -> Result<(), MaintenanceIssue> {
    let raw = serde_json::to_string(meta).map_err(MaintenanceIssue::cache)?;
    self.properties.set(key, &raw).map_err(MaintenanceIssue::cache)
  }

  fn fingerprint(&self, resource: &str, shape: Shape) -> String {
    let height = shape.rows.saturating_sub(FIRST_DATA_ROW - 1);
    let mut columns = Vec::with_capacity(VOLATILE_COLUMNS.len());
    if height > 0 {
      for col in VOLATILE_COLUMNS.into_iter().filter(|c| *c <= shape.cols) {
        match self.tables.get_range(resource, FIRST_DATA_ROW, col, height, 1) {
          Ok(cells) => columns.push(cells),
          Err(e) => {
            // Unstable on purpose: every read misses until storage recovers.
            tracing::warn!(resource, error = %e, "fingerprint read failed");
            return format!("unavailable-{}", new_etag());
          }
        }
      }
    }
    fingerprint(shape, &columns)
  }

  // ── Entries ──────────────────────────────────────────────────────────────

  /// Cached value for `key`; any failure reads as a miss.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = match self.cache.get(&self.namespaced(key)) {
      Ok(raw) => raw?,
      Err(e) => {
        tracing::debug!(key, error = %e, "cache read failed");
        return None;
      }
    };
    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        tracing::debug!(key, error = %e, "discarding undecodable cache entry");
        None
      }
    }
  }

  pub fn put<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl: Duration,
  ) -> Result<(), MaintenanceIssue> {
    let raw = serde_json::to_string(value).map_err(MaintenanceIssue::cache)?;
    self
      .cache
      .put(&self.namespaced(key), &raw, ttl)
      .map_err(|e| {
        tracing::debug!(key, error = %e, "cache write failed");
        MaintenanceIssue::cache(e)
      })
  }

  /// Retire every entry by rotating the namespace version.
  pub fn invalidate_all(&self, reason: &str) -> Result<String, MaintenanceIssue> {
    let version = new_etag();
    self
      .properties
      .set(CACHE_VERSION_PROPERTY, &version)
      .map_err(MaintenanceIssue::cache)?;
    tracing::info!(reason, version = %version, "rotated cache namespace");
    Ok(version)
  }

  fn namespaced(&self, key: &str) -> String {
    let version = self
      .properties
      .get(CACHE_VERSION_PROPERTY)
      .ok()
      .flatten()
      .unwrap_or_else(|| "0".to_owned());
    let full = format!("v{version}:{key}");
    if full.len() <= MAX_KEY_LEN {
      full
    } else {
      format!("v{version}:h:{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
  }
}

fn etag_property(resource: &str) -> String { format!("{ETAG_PROPERTY_PREFIX}{resource}") }

/// Cache key of one record, valid only while `etag` is current.
pub(crate) fn record_key(table: &str, etag: &str, id: &str) -> String {
  format!("record:{table}:{etag}:{id}")
}
