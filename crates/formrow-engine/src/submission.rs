//! [`SubmissionStore`]: the write path.
//!
//! A save runs, in order: advisory lock (bounded, best-effort), existing-row
//! resolution, closed-record guard, version check, dedup check, one bulk row
//! write, index row write (best-effort), etag bump and record pre-warm. Only
//! the row write and the checks before it can fail the save; everything
//! after it is reported as a [`MaintenanceIssue`].

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use formrow_core::{
  dedup::{DedupCandidate, DedupEvaluator, DedupRule},
  form::Form,
  record::{
    DEFAULT_LANGUAGE, DRAFT_STATUS, MaintenanceIssue, Record, RecordMeta,
    SUBMITTED_STATUS, SaveMode, SaveRequest, SaveResponse, WriteOrigin,
  },
  store::{AdvisoryLock, TabularStore},
};
use uuid::Uuid;

use crate::{
  Error, Result,
  cache::{CacheStore, record_key},
  etag::EtagReason,
  index::{IndexEntry, IndexHandle, RecordIndex},
  layout::{StoredRow, TableLayout},
  lock::LockGuard,
  options::EngineOptions,
};

/// Outcome of a successful save.
#[derive(Debug, Clone)]
pub struct SaveReceipt {
  pub record:     Record,
  pub row_number: usize,
  pub created:    bool,
  /// The table's etag after the save, if it could be bumped.
  pub etag:       Option<String>,
  pub warnings:   Vec<MaintenanceIssue>,
}

impl SaveReceipt {
  pub fn meta(&self) -> RecordMeta {
    RecordMeta {
      id:           self.record.id.clone(),
      created_at:   self.record.created_at,
      updated_at:   self.record.updated_at,
      data_version: self.record.data_version,
      row_number:   self.row_number,
    }
  }

  pub fn into_response(self) -> SaveResponse {
    SaveResponse {
      success:   true,
      message:   if self.created { "Record created" } else { "Record saved" }.to_owned(),
      code:      None,
      record_id: Some(self.record.id.clone()),
      meta:      Some(self.meta()),
      warnings:  self.warnings,
    }
  }
}

#[derive(Clone)]
pub struct SubmissionStore {
  tables:    Arc<dyn TabularStore>,
  lock:      Arc<dyn AdvisoryLock>,
  cache:     CacheStore,
  index:     RecordIndex,
  evaluator: Arc<dyn DedupEvaluator>,
  options:   Arc<EngineOptions>,
}

impl SubmissionStore {
  pub fn new(
    tables: Arc<dyn TabularStore>,
    lock: Arc<dyn AdvisoryLock>,
    cache: CacheStore,
    index: RecordIndex,
    evaluator: Arc<dyn DedupEvaluator>,
    options: Arc<EngineOptions>,
  ) -> Self {
    Self { tables, lock, cache, index, evaluator, options }
  }

  /// Create or update one record of `form`.
  #[tracing::instrument(
    skip_all,
    fields(form = %form.form_key, record_id = tracing::field::Empty)
  )]
  pub fn save(&self, form: &Form, request: SaveRequest) -> Result<SaveReceipt> {
    validate_request(form, &request)?;
    let table = form.destination.as_str();
    let _guard = LockGuard::acquire(
      self.lock.as_ref(),
      format!("save:{table}"),
      self.options.lock_timeout(),
    );

    let layout = TableLayout::ensure(self.tables.as_ref(), form)?;
    let mut warnings = Vec::new();
    let index = match self.index.ensure(table, &form.rules) {
      Ok(handle) => Some(handle),
      Err(e) => {
        tracing::warn!(table, error = %e, "record index unavailable");
        warnings.push(MaintenanceIssue::index(&e));
        None
      }
    };

    let existing = match request.record_id.as_deref() {
      Some(id) => self.resolve(&layout, index.as_ref(), id)?,
      None => None,
    };
    let record_id = request
      .record_id
      .clone()
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::Span::current().record("record_id", record_id.as_str());

    if let Some((_, prev)) = &existing {
      self.check_closed(&record_id, prev, &request)?;
      check_version(&record_id, prev, request.client_observed_version)?;
    }

    let draft = build_record(form, &request, record_id, existing.as_ref().map(|(_, p)| p), Utc::now());
    // Work with the record as a cold read will decode it, so cached copies,
    // signatures and the receipt agree with the table.
    let row = layout.encode(&draft);
    let record = layout
      .decode(&row)
      .into_record()
      .ok_or_else(|| Error::InvalidRequest(format!("record id {:?} is not valid", draft.id)))?;
    let signatures = signatures(self.evaluator.as_ref(), &form.rules, &record, request.save_mode);
    self.check_duplicates(form, &layout, index.as_ref(), &record, &signatures, &request)?;

    let (row_number, created) = match &existing {
      Some((row_number, _)) => {
        self.tables.set_range(table, *row_number, 1, &[row])?;
        (*row_number, false)
      }
      None => (self.tables.append_row(table, &row)?, true),
    };
    if created {
      tracing::info!(table, row_number, "created record");
    } else {
      tracing::debug!(table, row_number, version = record.data_version, "updated record");
    }

    if let Some(handle) = &index
      && let Err(e) =
        self.index.write_row(handle, row_number, &IndexEntry::from(&record), &signatures)
    {
      tracing::warn!(table, row_number, error = %e, "index row write failed");
      warnings.push(MaintenanceIssue::index(&e));
    }

    let etag = match self.cache.bump(table, EtagReason::Write) {
      Ok(etag) => {
        let key = record_key(table, &etag, &record.id);
        if let Err(issue) = self.cache.put(&key, &record, self.options.record_cache_ttl()) {
          warnings.push(issue);
        }
        Some(etag)
      }
      Err(issue) => {
        warnings.push(issue);
        // Readers now key on the fallback etag; warm that entry instead.
        if let Some(current) = self.cache.current_etag(table) {
          let key = record_key(table, &current, &record.id);
          let _ = self.cache.put(&key, &record, self.options.record_cache_ttl());
        }
        None
      }
    };

    Ok(SaveReceipt { record, row_number, created, etag, warnings })
  }

  /// Find the stored row for `id`, if any.
  fn resolve(
    &self,
    layout: &TableLayout,
    index: Option<&IndexHandle>,
    id: &str,
  ) -> Result<Option<(usize, StoredRow)>> {
    let Some(row) = self.index.locate(index, layout.table(), id)? else {
      return Ok(None);
    };
    let stored = layout.read_row(self.tables.as_ref(), row)?;
    Ok(Some((row, stored)))
  }

  fn check_closed(&self, record_id: &str, prev: &StoredRow, request: &SaveRequest) -> Result<()> {
    if self.options.is_closed(&prev.status)
      && request.origin == WriteOrigin::Background
      && !request.allow_closed
    {
      return Err(Error::ClosedRecord {
        record_id: record_id.to_owned(),
        status:    prev.status.clone(),
      });
    }
    Ok(())
  }

  fn check_duplicates(
    &self,
    form: &Form,
    layout: &TableLayout,
    index: Option<&IndexHandle>,
    record: &Record,
    signatures: &BTreeMap<String, String>,
    request: &SaveRequest,
  ) -> Result<()> {
    let enforced: Vec<(&DedupRule, &str)> = form
      .active_rules()
      .filter_map(|rule| {
        let sig = signatures.get(&rule.id).filter(|s| !s.is_empty())?;
        Some((rule, sig.as_str()))
      })
      .collect();
    if enforced.is_empty() {
      return Ok(());
    }

    let not_built = || Error::IndexNotBuilt {
      table:     form.destination.clone(),
      record_id: request.record_id.clone(),
    };
    let Some(handle) = index else {
      return Err(not_built());
    };
    if !self.index.is_built(handle)? {
      tracing::warn!(table = %form.destination, "index does not cover table, refusing dedup-governed save");
      return Err(not_built());
    }

    let main_rows = self.tables.row_count(&form.destination)?;
    for (rule, sig) in enforced {
      let Some(hit) = self.index.find_row_by_signature(handle, &rule.id, sig)? else {
        continue;
      };
      // Rows past the end of the main table are leftovers of deleted rows.
      if hit.row_number > main_rows || hit.record_id == record.id {
        continue;
      }

      // The main table is authoritative: confirm the match against the row
      // the index points at.
      let stored = layout.read_row(self.tables.as_ref(), hit.row_number)?;
      if stored.id.as_deref() != Some(hit.record_id.as_str()) {
        tracing::warn!(rule = %rule.id, row = hit.row_number, "index row does not match table row");
        return Err(not_built());
      }
      let candidate = DedupCandidate {
        record_id: Some(record.id.clone()),
        values:    record.values.clone(),
      };
      let existing = DedupCandidate { record_id: stored.id, values: stored.values };
      let Some(conflict) = self.evaluator.conflict(
        std::slice::from_ref(rule),
        &candidate,
        std::slice::from_ref(&existing),
        &record.language,
      ) else {
        tracing::warn!(rule = %rule.id, row = hit.row_number, "index signature is stale");
        return Err(not_built());
      };

      tracing::info!(rule = %rule.id, existing = %hit.record_id, "duplicate submission rejected");
      return Err(Error::Duplicate {
        rule_id:            conflict.rule_id,
        message:            conflict.message,
        record_id:          request.record_id.clone(),
        existing_record_id: conflict.existing_record_id.unwrap_or(hit.record_id),
      });
    }
    Ok(())
  }
}

fn validate_request(form: &Form, request: &SaveRequest) -> Result<()> {
  if request.form_key != form.form_key {
    return Err(Error::InvalidRequest(format!(
      "request is for form {:?}, not {:?}",
      request.form_key, form.form_key
    )));
  }
  if let Some(id) = &request.record_id
    && (id.trim().is_empty() || id.trim() != id || id.chars().any(char::is_control))
  {
    return Err(Error::InvalidRequest(format!("record id {id:?} is not valid")));
  }
  if let Some(field) = request.values.keys().find(|k| !form.declares(k)) {
    return Err(Error::UnknownField {
      form:  form.form_key.clone(),
      field: field.clone(),
    });
  }
  Ok(())
}

/// Reject when the stored version is newer than what the caller saw.
fn check_version(record_id: &str, prev: &StoredRow, observed: Option<u64>) -> Result<()> {
  let Some(observed) = observed else {
    return Ok(());
  };
  let stored = prev.data_version.unwrap_or(0);
  if stored > observed {
    tracing::info!(record_id, stored, observed, "stale write rejected");
    return Err(Error::StaleWrite { record_id: record_id.to_owned(), stored, observed });
  }
  Ok(())
}

fn build_record(
  form: &Form,
  request: &SaveRequest,
  id: String,
  prev: Option<&StoredRow>,
  now: DateTime<Utc>,
) -> Record {
  let mut values = prev.map(|p| p.values.clone()).unwrap_or_default();
  for (field, value) in &request.values {
    if value.is_blank() {
      values.remove(field);
    } else {
      values.insert(field.clone(), value.clone());
    }
  }

  let status = request
    .status_override
    .as_deref()
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_owned)
    .unwrap_or_else(|| derive_status(prev, request.save_mode));

  let language = [Some(request.language.as_str()), prev.map(|p| p.language.as_str())]
    .into_iter()
    .flatten()
    .find(|l| !l.is_empty())
    .unwrap_or(DEFAULT_LANGUAGE)
    .to_owned();

  let created_at = prev.and_then(|p| p.created_at).unwrap_or(now);
  Record {
    id,
    form_key: form.form_key.clone(),
    language,
    values,
    status,
    created_at,
    updated_at: now.max(created_at),
    data_version: prev.and_then(|p| p.data_version).unwrap_or(0) + 1,
    pdf_url: request.pdf_url.clone().or_else(|| prev.and_then(|p| p.pdf_url.clone())),
  }
}

fn derive_status(prev: Option<&StoredRow>, mode: SaveMode) -> String {
  match (prev.map(|p| p.status.as_str()), mode) {
    (Some(DRAFT_STATUS), SaveMode::Final) => SUBMITTED_STATUS.to_owned(),
    (Some(status), _) if !status.is_empty() => status.to_owned(),
    (_, SaveMode::Draft) => DRAFT_STATUS.to_owned(),
    (_, SaveMode::Final) => SUBMITTED_STATUS.to_owned(),
  }
}

/// Signature per active rule; rules that do not govern `mode` get an empty
/// signature so drafts never block final submissions.
pub(crate) fn signatures(
  evaluator: &dyn DedupEvaluator,
  rules: &[DedupRule],
  record: &Record,
  mode: SaveMode,
) -> BTreeMap<String, String> {
  rules
    .iter()
    .filter(|r| r.is_active())
    .map(|rule| {
      let sig = if rule.applies_to(mode) {
        evaluator.signature(rule, &record.values)
      } else {
        String::new()
      };
      (rule.id.clone(), sig)
    })
    .collect()
}
