//! [`ListingReader`]: paginated, by-id, by-row and batch reads.
//!
//! Pages are cached under a key that embeds the table's etag, so a write
//! (which bumps the etag) retires every cached page of that table without
//! touching the cache. Projected pages read only the requested columns.

use std::{
  collections::{BTreeMap, BTreeSet, HashSet},
  sync::Arc,
};

use formrow_core::{
  form::Form,
  listing::{
    BatchRequest, BatchResponse, HydratedRow, ListItem, ListRequest, ListResponse,
    ProjectedRow,
  },
  page::{decode_page_token, encode_page_token},
  record::{FieldValue, Record},
  store::{Row, TabularStore},
};

use crate::{
  Error, Result,
  cache::{CacheStore, record_key},
  layout::{COL_ID, FIRST_DATA_ROW, HEADER_ROW, META_WIDTH, StoredRow, TableLayout},
  options::EngineOptions,
  reconcile::{ReconcileMode, Reconciler},
  index::RecordIndex,
};

#[derive(Clone)]
pub struct ListingReader {
  tables:     Arc<dyn TabularStore>,
  cache:      CacheStore,
  index:      RecordIndex,
  reconciler: Reconciler,
  options:    Arc<EngineOptions>,
}

impl ListingReader {
  pub fn new(
    tables: Arc<dyn TabularStore>,
    cache: CacheStore,
    index: RecordIndex,
    reconciler: Reconciler,
    options: Arc<EngineOptions>,
  ) -> Self {
    Self { tables, cache, index, reconciler, options }
  }

  /// One page of `form`'s table.
  #[tracing::instrument(skip_all, fields(table = %form.destination, hydrate = request.hydrate))]
  pub fn fetch_page(&self, form: &Form, request: &ListRequest) -> Result<ListResponse> {
    let offset = decode_page_token(request.page_token.as_deref())?;
    let page_size = self.options.clamp_page_size(request.page_size);
    let table = form.destination.as_str();

    let Some(layout) = TableLayout::load(self.tables.as_ref(), table)? else {
      return Ok(ListResponse {
        items:           Vec::new(),
        next_page_token: None,
        total_count:     0,
        etag:            self.cache.get_or_init_etag(table, Default::default()),
      });
    };
    let columns = if request.hydrate {
      Vec::new()
    } else {
      projection_columns(form, &layout, &request.projection)?
    };

    let shape = self.tables.shape(table)?;
    let etag = self.cache.get_or_init_etag(table, shape);
    let key = page_key(table, &etag, request, page_size, offset);
    if let Some(page) = self.cache.get::<ListResponse>(&key) {
      tracing::debug!(offset, "page cache hit");
      return Ok(page);
    }
    tracing::debug!(offset, "page cache miss");

    let total_count = shape.rows.saturating_sub(HEADER_ROW);
    let scan_limit = total_count.min(self.options.max_scan_rows);
    let start = offset.min(scan_limit);
    let end = (start + page_size).min(scan_limit);
    let first_row = FIRST_DATA_ROW + start;
    let height = end - start;

    let items = if height == 0 {
      Vec::new()
    } else if request.hydrate {
      self.read_hydrated(&layout, first_row, height)?
    } else {
      self.read_projected(&layout, &columns, first_row, height)?
    };

    let page = ListResponse {
      items,
      next_page_token: (end < scan_limit).then(|| encode_page_token(end)),
      total_count,
      etag,
    };
    // A failed put only costs the next reader a miss.
    let _ = self.cache.put(&key, &page, self.options.page_cache_ttl());
    Ok(page)
  }

  /// The record with `record_id`, if it exists.
  pub fn fetch_by_id(&self, form: &Form, record_id: &str) -> Result<Option<Record>> {
    let record_id = record_id.trim();
    if record_id.is_empty() {
      return Err(Error::InvalidRequest("record id is empty".to_owned()));
    }
    let table = form.destination.as_str();
    let Some(layout) = TableLayout::load(self.tables.as_ref(), table)? else {
      return Ok(None);
    };

    let etag = self.cache.get_or_init_etag(table, self.tables.shape(table)?);
    let key = record_key(table, &etag, record_id);
    if let Some(record) = self.cache.get::<Record>(&key) {
      tracing::debug!(record_id, "record cache hit");
      return Ok(Some(record));
    }

    let handle = self.index.open(table).unwrap_or_else(|e| {
      tracing::warn!(table, error = %e, "record index unreadable, scanning");
      None
    });
    let Some(row) = self.index.locate(handle.as_ref(), table, record_id)? else {
      return Ok(None);
    };
    let record = layout.read_row(self.tables.as_ref(), row)?.into_record();
    if let Some(record) = &record {
      let _ = self.cache.put(&key, record, self.options.record_cache_ttl());
    }
    Ok(record)
  }

  /// The record stored at physical row `row_number`. A row written without
  /// an id gets one assigned and persisted first.
  pub fn fetch_by_row_number(&self, form: &Form, row_number: usize) -> Result<Option<HydratedRow>> {
    if row_number < FIRST_DATA_ROW {
      return Err(Error::InvalidRequest(format!(
        "row {row_number} is not a data row (data starts at row {FIRST_DATA_ROW})"
      )));
    }
    let table = form.destination.as_str();
    let Some(layout) = TableLayout::load(self.tables.as_ref(), table)? else {
      return Ok(None);
    };
    if row_number > self.tables.row_count(table)? {
      return Ok(None);
    }

    let mut stored = layout.read_row(self.tables.as_ref(), row_number)?;
    if is_blank(&stored) {
      return Ok(None);
    }
    if stored.id.is_none() {
      let report =
        self
          .reconciler
          .reconcile_rows(form, row_number, 1, ReconcileMode::RebuildOnly)?;
      tracing::info!(table, row_number, etag = ?report.etag, "assigned id to legacy row");
      stored = layout.read_row(self.tables.as_ref(), row_number)?;
    }
    Ok(stored.into_record().map(|record| HydratedRow { row_number, record }))
  }

  /// A page plus the requested records that are not on it.
  pub fn fetch_batch(&self, form: &Form, request: &BatchRequest) -> Result<BatchResponse> {
    let page = self.fetch_page(form, &request.list)?;
    let on_page: HashSet<&str> = page.items.iter().filter_map(ListItem::id).collect();

    let mut extras = BTreeMap::new();
    let mut missing = Vec::new();
    let mut seen = HashSet::new();
    for id in request.ids.iter().map(|id| id.trim()) {
      if id.is_empty() || on_page.contains(id) || !seen.insert(id) {
        continue;
      }
      match self.fetch_by_id(form, id)? {
        Some(record) => {
          extras.insert(id.to_owned(), record);
        }
        None => missing.push(id.to_owned()),
      }
    }
    Ok(BatchResponse { page, extras, missing })
  }

  // ── Page assembly ────────────────────────────────────────────────────────

  fn read_hydrated(
    &self,
    layout: &TableLayout,
    first_row: usize,
    height: usize,
  ) -> Result<Vec<ListItem>> {
    let rows = self
      .tables
      .get_range(layout.table(), first_row, 1, height, layout.width())?;
    Ok(
      rows
        .iter()
        .enumerate()
        .map(|(offset, cells)| {
          let row_number = first_row + offset;
          let stored = layout.decode(cells);
          if stored.id.is_none() {
            // Legacy rows stay id-less until fetched by row number.
            return ListItem::Projected(ProjectedRow { row_number, id: None, values: stored.values });
          }
          match stored.into_record() {
            Some(record) => ListItem::Hydrated(HydratedRow { row_number, record }),
            None => ListItem::Projected(ProjectedRow { row_number, id: None, values: Default::default() }),
          }
        })
        .collect(),
    )
  }

  /// Reads each contiguous run of projected columns with one range read.
  fn read_projected(
    &self,
    layout: &TableLayout,
    columns: &[(String, usize)],
    first_row: usize,
    height: usize,
  ) -> Result<Vec<ListItem>> {
    let wanted: BTreeSet<usize> =
      columns.iter().map(|(_, col)| *col).chain([COL_ID]).collect();

    let mut by_column: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (start, width) in contiguous_runs(&wanted) {
      let block = self
        .tables
        .get_range(layout.table(), first_row, start, height, width)?;
      for i in 0..width {
        let column: Vec<String> = block
          .iter()
          .map(|row: &Row| row.get(i).cloned().unwrap_or_default())
          .collect();
        by_column.insert(start + i, column);
      }
    }

    let cell = |col: usize, offset: usize| {
      by_column
        .get(&col)
        .and_then(|cells| cells.get(offset))
        .map(String::as_str)
        .unwrap_or("")
    };
    Ok(
      (0..height)
        .map(|offset| {
          let id = Some(cell(COL_ID, offset).trim().to_owned()).filter(|id| !id.is_empty());
          let values = columns
            .iter()
            .filter_map(|(name, col)| {
              FieldValue::from_cell(cell(*col, offset)).map(|v| (name.clone(), v))
            })
            .collect();
          ListItem::Projected(ProjectedRow { row_number: first_row + offset, id, values })
        })
        .collect(),
    )
  }
}

/// Resolve projection names to columns. An empty projection selects every
/// declared field the table has a column for.
fn projection_columns(
  form: &Form,
  layout: &TableLayout,
  projection: &[String],
) -> Result<Vec<(String, usize)>> {
  if projection.is_empty() {
    return Ok(
      form
        .fields
        .iter()
        .filter_map(|f| layout.column(f).filter(|c| *c > META_WIDTH).map(|c| (f.clone(), c)))
        .collect(),
    );
  }
  projection
    .iter()
    .map(|name| {
      let name = name.trim();
      layout
        .column(name)
        .map(|col| (name.to_owned(), col))
        .ok_or_else(|| Error::UnknownField {
          form:  form.form_key.clone(),
          field: name.to_owned(),
        })
    })
    .collect()
}

/// `(first column, width)` for each run of consecutive column numbers.
fn contiguous_runs(columns: &BTreeSet<usize>) -> Vec<(usize, usize)> {
  let mut runs: Vec<(usize, usize)> = Vec::new();
  for &col in columns {
    match runs.last_mut() {
      Some((start, width)) if *start + *width == col => *width += 1,
      _ => runs.push((col, 1)),
    }
  }
  runs
}

fn page_key(
  table: &str,
  etag: &str,
  request: &ListRequest,
  page_size: usize,
  offset: usize,
) -> String {
  format!(
    "page:{table}:{etag}:{page_size}:{offset}:{}:{}",
    if request.hydrate { "h" } else { "p" },
    request.projection.join(","),
  )
}

fn is_blank(stored: &StoredRow) -> bool {
  stored.id.is_none()
    && stored.values.is_empty()
    && stored.status.is_empty()
    && stored.form_key.is_empty()
    && stored.data_version.is_none()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn runs_merge_adjacent_columns() {
    let cols: BTreeSet<usize> = [1, 2, 3, 7, 9, 10].into_iter().collect();
    assert_eq!(contiguous_runs(&cols), vec![(1, 3), (7, 1), (9, 2)]);
  }

  #[test]
  fn page_key_distinguishes_projection_and_mode() {
    let mut request = ListRequest { projection: vec!["A".into()], ..Default::default() };
    let a = page_key("T", "e1", &request, 10, 0);
    request.hydrate = true;
    let b = page_key("T", "e1", &request, 10, 0);
    assert_ne!(a, b);
    assert_ne!(a, page_key("T", "e2", &ListRequest::default(), 10, 0));
  }
}
