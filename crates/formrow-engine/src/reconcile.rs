//! [`Reconciler`]: repairs metadata and index rows after direct table edits.
//!
//! When rows are edited or appended straight into the main table, their ids,
//! versions and index rows drift. Reconciliation re-derives them for a row
//! range and follows the same sequence as a save: main-table write, index
//! write, etag bump. Scheduling (on edit, periodic, manual) is up to the
//! caller.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use formrow_core::{
  dedup::DedupEvaluator,
  form::Form,
  record::{DEFAULT_LANGUAGE, MaintenanceIssue, Record, SUBMITTED_STATUS, SaveMode},
  store::{AdvisoryLock, Row, TabularStore},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  cache::CacheStore,
  etag::EtagReason,
  index::{IndexEntry, IndexHandle, IndexRow, RecordIndex},
  layout::{COL_ID, FIRST_DATA_ROW, HEADER_ROW, StoredRow, TableLayout, meta_cells},
  lock::LockGuard,
  options::EngineOptions,
  submission::signatures,
};

const REBUILD_CHUNK_ROWS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileMode {
  /// Rows were edited: every row gets a new version and `updatedAt`.
  Edited,
  /// Only fill in missing metadata; existing versions are kept.
  RebuildOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
  pub rows:                     usize,
  pub ids_assigned:             usize,
  pub versions_advanced:        usize,
  pub index_rows_written:       usize,
  pub stale_index_rows_cleared: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub etag:                     Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub warnings:                 Vec<MaintenanceIssue>,
}

impl ReconcileReport {
  fn absorb(&mut self, other: ReconcileReport) {
    self.rows += other.rows;
    self.ids_assigned += other.ids_assigned;
    self.versions_advanced += other.versions_advanced;
    self.index_rows_written += other.index_rows_written;
    self.stale_index_rows_cleared += other.stale_index_rows_cleared;
    if other.etag.is_some() {
      self.etag = other.etag;
    }
    self.warnings.extend(other.warnings);
  }
}

#[derive(Clone)]
pub struct Reconciler {
  tables:    Arc<dyn TabularStore>,
  lock:      Arc<dyn AdvisoryLock>,
  cache:     CacheStore,
  index:     RecordIndex,
  evaluator: Arc<dyn DedupEvaluator>,
  options:   Arc<EngineOptions>,
}

impl Reconciler {
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

  /// Re-derive metadata and index rows for `count` rows from `first_row`.
  /// Rows past the end of the table are ignored.
  #[tracing::instrument(skip_all, fields(table = %form.destination, first_row, count, ?mode))]
  pub fn reconcile_rows(
    &self,
    form: &Form,
    first_row: usize,
    count: usize,
    mode: ReconcileMode,
  ) -> Result<ReconcileReport> {
    if first_row < FIRST_DATA_ROW {
      return Err(Error::InvalidRequest(format!(
        "reconciliation starts at row {FIRST_DATA_ROW} or later, got {first_row}"
      )));
    }
    let _guard = LockGuard::acquire(
      self.lock.as_ref(),
      format!("save:{}", form.destination),
      self.options.lock_timeout(),
    );
    self.reconcile_locked(form, first_row, count, mode)
  }

  /// Rebuild the whole index from the main table, keeping versions, and
  /// blank index rows left behind by deleted main-table rows.
  #[tracing::instrument(skip_all, fields(table = %form.destination))]
  pub fn rebuild_index(&self, form: &Form) -> Result<ReconcileReport> {
    let table = form.destination.as_str();
    let _guard = LockGuard::acquire(
      self.lock.as_ref(),
      format!("save:{table}"),
      self.options.lock_timeout(),
    );
    if !self.tables.table_exists(table)? {
      return Err(Error::InvalidRequest(format!("table {table:?} does not exist")));
    }

    let main_rows = self.tables.row_count(table)?;
    let mut report = ReconcileReport::default();
    let mut first = FIRST_DATA_ROW;
    while first <= main_rows {
      let count = REBUILD_CHUNK_ROWS.min(main_rows - first + 1);
      report.absorb(self.reconcile_locked(form, first, count, ReconcileMode::RebuildOnly)?);
      first += count;
    }

    let handle = self.index.ensure(table, &form.rules)?;
    let index_rows = self.tables.row_count(&handle.table)?;
    let keep = main_rows.max(HEADER_ROW);
    if index_rows > keep {
      self.index.clear_rows(&handle, keep + 1, index_rows)?;
      report.stale_index_rows_cleared = index_rows - keep;
    }
    tracing::info!(
      rows = report.rows,
      ids_assigned = report.ids_assigned,
      cleared = report.stale_index_rows_cleared,
      "rebuilt record index"
    );
    Ok(report)
  }

  fn reconcile_locked(
    &self,
    form: &Form,
    first_row: usize,
    count: usize,
    mode: ReconcileMode,
  ) -> Result<ReconcileReport> {
    let table = form.destination.as_str();
    let Some(layout) = TableLayout::load(self.tables.as_ref(), table)? else {
      return Err(Error::InvalidRequest(format!("table {table:?} does not exist")));
    };
    let main_rows = self.tables.row_count(table)?;
    let last_row = (first_row + count).saturating_sub(1).min(main_rows);
    if count == 0 || first_row > last_row {
      return Ok(ReconcileReport::default());
    }
    let height = last_row - first_row + 1;

    let mut report = ReconcileReport { rows: height, ..Default::default() };
    let handle = match self.index.ensure(table, &form.rules) {
      Ok(handle) => Some(handle),
      Err(e) => {
        tracing::warn!(table, error = %e, "record index unavailable");
        report.warnings.push(MaintenanceIssue::index(&e));
        None
      }
    };
    let rows = self.tables.get_range(table, first_row, 1, height, layout.width())?;
    let prior = match &handle {
      Some(handle) => self.index.read_rows(handle, first_row, height).unwrap_or_else(|e| {
        tracing::warn!(table, error = %e, "prior index rows unreadable");
        vec![None; height]
      }),
      None => vec![None; height],
    };

    let now = Utc::now();
    let mut records = Vec::with_capacity(height);
    for (cells, indexed) in rows.iter().zip(prior.iter()) {
      let stored = layout.decode(cells);
      if stored.id.is_none() {
        report.ids_assigned += 1;
      }
      let (record, advanced) = rederive(form, stored, indexed.as_ref(), mode, now);
      if advanced {
        report.versions_advanced += 1;
      }
      records.push(record);
    }

    let meta: Vec<Row> = records.iter().map(meta_cells).collect();
    self.tables.set_range(table, first_row, 1, &meta)?;

    let aligned = match &handle {
      Some(handle) => self.write_index(form, handle, first_row, &records, &mut report),
      None => Ok(()),
    };

    let reason = match mode {
      ReconcileMode::RebuildOnly if report.ids_assigned > 0 => EtagReason::IdAssigned,
      _ => EtagReason::Reconcile,
    };
    match self.cache.bump(table, reason) {
      Ok(etag) => report.etag = Some(etag),
      Err(issue) => report.warnings.push(issue),
    }

    aligned?;
    tracing::info!(
      first_row,
      last_row,
      ids_assigned = report.ids_assigned,
      versions_advanced = report.versions_advanced,
      "reconciled rows"
    );
    Ok(report)
  }

  /// Write the index rows for `records`. Store failures are reported as
  /// warnings; only a misaligned index after a successful write is an error.
  fn write_index(
    &self,
    form: &Form,
    handle: &IndexHandle,
    first_row: usize,
    records: &[Record],
    report: &mut ReconcileReport,
  ) -> Result<()> {
    let rows: Vec<(IndexEntry, BTreeMap<String, String>)> = records
      .iter()
      .map(|record| {
        let mode = SaveMode::for_status(&record.status);
        let sigs = signatures(self.evaluator.as_ref(), &form.rules, record, mode);
        (IndexEntry::from(record), sigs)
      })
      .collect();
    if let Err(e) = self.index.write_rows(handle, first_row, &rows) {
      tracing::warn!(table = %handle.main_table, first_row, error = %e, "index rows write failed");
      report.warnings.push(MaintenanceIssue::index(&e));
      return Ok(());
    }
    report.index_rows_written = records.len();
    match self.assert_aligned(handle, first_row, records.len()) {
      Err(Error::Transient(e)) => {
        tracing::warn!(table = %handle.main_table, error = %e, "index alignment unverified");
        report.warnings.push(MaintenanceIssue::index(&e));
        Ok(())
      }
      other => other,
    }
  }

  /// Index row `R` must name the record stored at main-table row `R`.
  fn assert_aligned(&self, handle: &IndexHandle, first_row: usize, height: usize) -> Result<()> {
    let main_ids = self.tables.get_range(&handle.main_table, first_row, COL_ID, height, 1)?;
    let index_rows = self.index.read_rows(handle, first_row, height)?;
    for (offset, (main, indexed)) in main_ids.iter().zip(index_rows.iter()).enumerate() {
      let expected = main.first().map(|c| c.trim()).unwrap_or("");
      let found = indexed.as_ref().map(|r| r.entry.record_id.as_str()).unwrap_or("");
      if expected != found {
        return Err(Error::AlignmentViolation {
          row:      first_row + offset,
          expected: expected.to_owned(),
          found:    found.to_owned(),
        });
      }
    }
    Ok(())
  }
}

/// Rebuild a record from a stored row. Returns whether the version moved.
fn rederive(
  form: &Form,
  stored: StoredRow,
  indexed: Option<&IndexRow>,
  mode: ReconcileMode,
  now: DateTime<Utc>,
) -> (Record, bool) {
  let id = stored.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
  let index_version = indexed
    .filter(|r| r.entry.record_id == id)
    .map(|r| r.entry.data_version)
    .unwrap_or(0);
  let prior = stored.data_version.unwrap_or(0).max(index_version);
  let created_at = stored.created_at.unwrap_or(now);

  let (data_version, updated_at, advanced) = match (mode, stored.data_version) {
    (ReconcileMode::Edited, _) => (prior + 1, now, true),
    (ReconcileMode::RebuildOnly, Some(v)) if v > 0 => {
      (v, stored.updated_at.unwrap_or(created_at), false)
    }
    (ReconcileMode::RebuildOnly, _) => (prior + 1, stored.updated_at.unwrap_or(now), true),
  };

  let or_default = |value: String, fallback: &str| {
    if value.is_empty() { fallback.to_owned() } else { value }
  };
  let record = Record {
    id,
    form_key: or_default(stored.form_key, &form.form_key),
    language: or_default(stored.language, DEFAULT_LANGUAGE),
    status: or_default(stored.status, SUBMITTED_STATUS),
    values: stored.values,
    created_at,
    updated_at: updated_at.max(created_at),
    data_version,
    pdf_url: stored.pdf_url,
  };
  (record, advanced)
}
