//! [`RecordIndex`]: a secondary table, row-aligned with the main table.
//!
//! Index row `R` always describes the record physically stored at row `R` of
//! the main table. Lookups search one narrow column of the index instead of
//! the full-width main table, and dedup signatures live in one `DEDUP:<rule>`
//! column per reject-scoped rule.

use std::{collections::BTreeMap, sync::Arc};

use formrow_core::{
  StoreError,
  dedup::{DEDUP_COLUMN_PREFIX, DedupRule},
  record::Record,
  store::{Cell, Row, TabularStore},
};

use crate::layout::{COL_ID, FIRST_DATA_ROW, HEADER_ROW, encode_timestamp};

/// Suffix appended to a main table's name to name its index.
pub const INDEX_SUFFIX: &str = "__index";

/// Fixed leading index columns, in physical order.
pub const INDEX_BASE_COLUMNS: [&str; 5] =
  ["RecordId", "RowNumber", "DataVersion", "UpdatedAtIso", "CreatedAtIso"];

const IDX_RECORD_ID: usize = 1;
const IDX_ROW_NUMBER: usize = 2;
const IDX_DATA_VERSION: usize = 3;
const IDX_UPDATED_AT: usize = 4;
const IDX_CREATED_AT: usize = 5;

pub fn index_table_name(main_table: &str) -> String { format!("{main_table}{INDEX_SUFFIX}") }

// ─── Handle and rows ─────────────────────────────────────────────────────────

/// An opened index: its table name and header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
  pub table:      String,
  pub main_table: String,
  header:         Vec<String>,
}

impl IndexHandle {
  pub fn width(&self) -> usize { self.header.len() }

  fn column(&self, name: &str) -> Option<usize> {
    self.header.iter().position(|h| h == name).map(|i| i + 1)
  }

  fn signature_column(&self, rule_id: &str) -> Option<usize> {
    self.column(&format!("{DEDUP_COLUMN_PREFIX}{rule_id}"))
  }

  fn encode(&self, row_number: usize, entry: &IndexEntry, signatures: &BTreeMap<String, String>) -> Row {
    let mut row = vec![Cell::new(); self.width()];
    row[IDX_RECORD_ID - 1] = entry.record_id.clone();
    row[IDX_ROW_NUMBER - 1] = row_number.to_string();
    row[IDX_DATA_VERSION - 1] = entry.data_version.to_string();
    row[IDX_UPDATED_AT - 1] = entry.updated_at.clone();
    row[IDX_CREATED_AT - 1] = entry.created_at.clone();
    for (rule_id, signature) in signatures {
      if let Some(col) = self.signature_column(rule_id) {
        row[col - 1] = signature.clone();
      }
    }
    row
  }

  fn decode(&self, cells: &[Cell]) -> Option<IndexRow> {
    let cell = |col: usize| cells.get(col - 1).map(String::as_str).unwrap_or("");
    let record_id = cell(IDX_RECORD_ID);
    if record_id.is_empty() {
      return None;
    }
    let signatures = self
      .header
      .iter()
      .enumerate()
      .filter_map(|(i, name)| {
        let rule_id = name.strip_prefix(DEDUP_COLUMN_PREFIX)?;
        Some((rule_id.to_owned(), cells.get(i).cloned().unwrap_or_default()))
      })
      .collect();
    Some(IndexRow {
      row_number: cell(IDX_ROW_NUMBER).parse().unwrap_or(0),
      entry: IndexEntry {
        record_id:    record_id.to_owned(),
        data_version: cell(IDX_DATA_VERSION).parse().unwrap_or(0),
        updated_at:   cell(IDX_UPDATED_AT).to_owned(),
        created_at:   cell(IDX_CREATED_AT).to_owned(),
      },
      signatures,
    })
  }
}

/// The per-record fields an index row carries besides signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
  pub record_id:    String,
  pub data_version: u64,
  pub updated_at:   String,
  pub created_at:   String,
}

impl From<&Record> for IndexEntry {
  fn from(record: &Record) -> Self {
    Self {
      record_id:    record.id.clone(),
      data_version: record.data_version,
      updated_at:   encode_timestamp(record.updated_at),
      created_at:   encode_timestamp(record.created_at),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
  pub row_number: usize,
  pub entry:      IndexEntry,
  /// Rule id → signature.
  pub signatures: BTreeMap<String, String>,
}

/// A dedup signature hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
  pub row_number: usize,
  pub record_id:  String,
}

// ─── Index ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RecordIndex {
  tables:                Arc<dyn TabularStore>,
  linear_scan_threshold: usize,
}

impl RecordIndex {
  pub fn new(tables: Arc<dyn TabularStore>, linear_scan_threshold: usize) -> Self {
    Self { tables, linear_scan_threshold }
  }

  /// Open the index for `main_table`, creating it or appending dedup
  /// columns for active rules it does not have yet. Columns are never
  /// removed.
  pub fn ensure(&self, main_table: &str, rules: &[DedupRule]) -> Result<IndexHandle, StoreError> {
    let table = index_table_name(main_table);
    let wanted: Vec<String> = rules
      .iter()
      .filter(|r| r.is_active())
      .map(DedupRule::column_name)
      .collect();

    if !self.tables.table_exists(&table)? {
      let header: Row = INDEX_BASE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(wanted.iter().cloned())
        .collect();
      match self.tables.create_table(&table, &header) {
        Ok(()) => {
          tracing::info!(table = %table, "created record index");
          return Ok(IndexHandle { table, main_table: main_table.to_owned(), header });
        }
        Err(StoreError::TableExists(_)) => {}
        Err(e) => return Err(e),
      }
    }

    let mut handle = self.read_handle(main_table, table)?;
    if handle.header.len() < INDEX_BASE_COLUMNS.len() {
      handle.header = INDEX_BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
      self.tables.set_range(&handle.table, HEADER_ROW, 1, &[handle.header.clone()])?;
    }
    let missing: Row = wanted
      .into_iter()
      .filter(|c| handle.column(c).is_none())
      .collect();
    if !missing.is_empty() {
      self
        .tables
        .set_range(&handle.table, HEADER_ROW, handle.width() + 1, &[missing.clone()])?;
      tracing::info!(table = %handle.table, columns = ?missing, "added dedup columns to index");
      handle.header.extend(missing);
    }
    Ok(handle)
  }

  /// Open the index without creating or altering it.
  pub fn open(&self, main_table: &str) -> Result<Option<IndexHandle>, StoreError> {
    let table = index_table_name(main_table);
    if !self.tables.table_exists(&table)? {
      return Ok(None);
    }
    self.read_handle(main_table, table).map(Some)
  }

  fn read_handle(&self, main_table: &str, table: String) -> Result<IndexHandle, StoreError> {
    let cols = self.tables.col_count(&table)?;
    let mut header = if cols == 0 {
      Row::new()
    } else {
      self
        .tables
        .get_range(&table, HEADER_ROW, 1, 1, cols)?
        .into_iter()
        .next()
        .unwrap_or_default()
    };
    while header.last().is_some_and(|c| c.is_empty()) {
      header.pop();
    }
    Ok(IndexHandle { table, main_table: main_table.to_owned(), header })
  }

  // ── Lookup ───────────────────────────────────────────────────────────────

  /// Exact-match search of one column below the header. Small tables are
  /// scanned; larger ones use the store's find primitive.
  fn find_in_column(&self, table: &str, col: usize, needle: &str) -> Result<Option<usize>, StoreError> {
    if needle.is_empty() {
      return Ok(None);
    }
    let rows = self.tables.row_count(table)?;
    if rows < FIRST_DATA_ROW {
      return Ok(None);
    }
    if rows - HEADER_ROW <= self.linear_scan_threshold {
      formrow_core::store::scan_exact(self.tables.as_ref(), table, col, FIRST_DATA_ROW, needle)
    } else {
      self.tables.find_exact(table, col, FIRST_DATA_ROW, needle)
    }
  }

  /// Index row position of `record_id`, which by alignment is also its
  /// main-table row.
  pub fn find_row(&self, handle: &IndexHandle, record_id: &str) -> Result<Option<usize>, StoreError> {
    self.find_in_column(&handle.table, IDX_RECORD_ID, record_id)
  }

  pub fn find_row_by_signature(
    &self,
    handle: &IndexHandle,
    rule_id: &str,
    signature: &str,
  ) -> Result<Option<SignatureMatch>, StoreError> {
    let Some(col) = handle.signature_column(rule_id) else {
      return Ok(None);
    };
    let Some(row_number) = self.find_in_column(&handle.table, col, signature)? else {
      return Ok(None);
    };
    let record_id = self.cell(&handle.table, row_number, IDX_RECORD_ID)?;
    Ok(Some(SignatureMatch { row_number, record_id }))
  }

  pub fn read_row(&self, handle: &IndexHandle, row_number: usize) -> Result<Option<IndexRow>, StoreError> {
    let cells = self.tables.get_range(&handle.table, row_number, 1, 1, handle.width())?;
    Ok(cells.first().and_then(|c| handle.decode(c)))
  }

  /// Read `height` index rows starting at `first_row`, one entry per row.
  pub fn read_rows(
    &self,
    handle: &IndexHandle,
    first_row: usize,
    height: usize,
  ) -> Result<Vec<Option<IndexRow>>, StoreError> {
    let cells = self.tables.get_range(&handle.table, first_row, 1, height, handle.width())?;
    Ok(cells.iter().map(|c| handle.decode(c)).collect())
  }

  /// Resolve `record_id` to its main-table row: index first, verified
  /// against the main table, then a scan of the main table's id column.
  pub fn locate(
    &self,
    handle: Option<&IndexHandle>,
    main_table: &str,
    record_id: &str,
  ) -> Result<Option<usize>, StoreError> {
    if let Some(handle) = handle
      && let Some(row) = self.find_row(handle, record_id)?
    {
      if self.cell(main_table, row, COL_ID)? == record_id {
        return Ok(Some(row));
      }
      tracing::warn!(main_table, record_id, row, "index row is stale, scanning");
    }
    self.find_in_column(main_table, COL_ID, record_id)
  }

  // ── Writes ───────────────────────────────────────────────────────────────

  /// Overwrite the whole index row at `row_number` in one range write.
  pub fn write_row(
    &self,
    handle: &IndexHandle,
    row_number: usize,
    entry: &IndexEntry,
    signatures: &BTreeMap<String, String>,
  ) -> Result<(), StoreError> {
    let row = handle.encode(row_number, entry, signatures);
    self.tables.set_range(&handle.table, row_number, 1, &[row])
  }

  /// Overwrite consecutive index rows starting at `first_row` in one range
  /// write.
  pub fn write_rows(
    &self,
    handle: &IndexHandle,
    first_row: usize,
    rows: &[(IndexEntry, BTreeMap<String, String>)],
  ) -> Result<(), StoreError> {
    if rows.is_empty() {
      return Ok(());
    }
    let encoded: Vec<Row> = rows
      .iter()
      .enumerate()
      .map(|(offset, (entry, sigs))| handle.encode(first_row + offset, entry, sigs))
      .collect();
    self.tables.set_range(&handle.table, first_row, 1, &encoded)
  }

  /// Blank index rows from `first_row` through `last_row`.
  pub fn clear_rows(&self, handle: &IndexHandle, first_row: usize, last_row: usize) -> Result<(), StoreError> {
    if first_row > last_row {
      return Ok(());
    }
    let blank = vec![vec![Cell::new(); handle.width()]; last_row - first_row + 1];
    self.tables.set_range(&handle.table, first_row, 1, &blank)
  }

  // ── Health ───────────────────────────────────────────────────────────────

  /// Whether the index covers the main table, judged by a sentinel: the last
  /// main-table row must carry an id and the index row at the same position
  /// must name it. An empty main table is trivially covered.
  pub fn is_built(&self, handle: &IndexHandle) -> Result<bool, StoreError> {
    let main_rows = self.tables.row_count(&handle.main_table)?;
    if main_rows < FIRST_DATA_ROW {
      return Ok(true);
    }
    let main_id = self.cell(&handle.main_table, main_rows, COL_ID)?;
    if main_id.is_empty() {
      return Ok(false);
    }
    Ok(self.cell(&handle.table, main_rows, IDX_RECORD_ID)? == main_id)
  }

  fn cell(&self, table: &str, row: usize, col: usize) -> Result<String, StoreError> {
    let cells = self.tables.get_range(table, row, col, 1, 1)?;
    Ok(
      cells
        .into_iter()
        .next()
        .and_then(|r| r.into_iter().next())
        .unwrap_or_default()
        .trim()
        .to_owned(),
    )
  }
}

#[cfg(test)]
mod tests {
  use formrow_core::dedup::DedupRuleConfig;

  use super::*;
  use crate::memory::MemoryTables;

  fn rule(id: &str) -> DedupRule {
    DedupRule::from_config(
      DedupRuleConfig { id: id.into(), keys: vec!["EMAIL".into()], ..Default::default() },
      &["EMAIL".to_string()],
    )
    .unwrap()
  }

  fn entry(id: &str) -> IndexEntry {
    IndexEntry {
      record_id:    id.into(),
      data_version: 1,
      updated_at:   "2024-01-01T00:00:00.000Z".into(),
      created_at:   "2024-01-01T00:00:00.000Z".into(),
    }
  }

  fn setup() -> (RecordIndex, Arc<MemoryTables>) {
    let tables = Arc::new(MemoryTables::default());
    tables.create_table("Main", &["Record ID".to_string()]).unwrap();
    (RecordIndex::new(tables.clone(), 50), tables)
  }

  #[test]
  fn ensure_is_additive() {
    let (index, tables) = setup();
    let h = index.ensure("Main", &[rule("a")]).unwrap();
    assert_eq!(h.width(), INDEX_BASE_COLUMNS.len() + 1);

    let h = index.ensure("Main", &[rule("b")]).unwrap();
    assert_eq!(h.width(), INDEX_BASE_COLUMNS.len() + 2);
    let header = tables.get_range(&h.table, 1, 1, 1, h.width()).unwrap();
    assert_eq!(header[0][5], "DEDUP:a");
    assert_eq!(header[0][6], "DEDUP:b");
  }

  #[test]
  fn write_then_find_by_id_and_signature() {
    let (index, _) = setup();
    let h = index.ensure("Main", &[rule("a")]).unwrap();
    let sigs = BTreeMap::from([("a".to_string(), "sig-1".to_string())]);
    index.write_row(&h, 3, &entry("rec-3"), &sigs).unwrap();

    assert_eq!(index.find_row(&h, "rec-3").unwrap(), Some(3));
    assert_eq!(index.find_row(&h, "rec").unwrap(), None);
    assert_eq!(
      index.find_row_by_signature(&h, "a", "sig-1").unwrap(),
      Some(SignatureMatch { row_number: 3, record_id: "rec-3".into() })
    );
    assert_eq!(index.find_row_by_signature(&h, "missing", "sig-1").unwrap(), None);

    let row = index.read_row(&h, 3).unwrap().unwrap();
    assert_eq!(row.row_number, 3);
    assert_eq!(row.signatures["a"], "sig-1");
    assert!(index.read_row(&h, 2).unwrap().is_none());
  }

  #[test]
  fn sentinel_detects_unbuilt_index() {
    let (index, tables) = setup();
    let h = index.ensure("Main", &[]).unwrap();
    assert!(index.is_built(&h).unwrap());

    tables.append_row("Main", &["rec-2".to_string()]).unwrap();
    assert!(!index.is_built(&h).unwrap());

    index.write_row(&h, 2, &entry("rec-2"), &BTreeMap::new()).unwrap();
    assert!(index.is_built(&h).unwrap());
  }

  #[test]
  fn locate_falls_back_to_scan_when_index_is_stale() {
    let (index, tables) = setup();
    let h = index.ensure("Main", &[]).unwrap();
    tables.append_row("Main", &["rec-2".to_string()]).unwrap();
    tables.append_row("Main", &["rec-3".to_string()]).unwrap();
    // Index claims rec-3 lives at row 2.
    index.write_row(&h, 2, &entry("rec-3"), &BTreeMap::new()).unwrap();

    assert_eq!(index.locate(Some(&h), "Main", "rec-3").unwrap(), Some(3));
    assert_eq!(index.locate(None, "Main", "rec-2").unwrap(), Some(2));
    assert_eq!(index.locate(Some(&h), "Main", "rec-9").unwrap(), None);
  }

  #[test]
  fn large_tables_use_the_find_primitive() {
    let tables = Arc::new(MemoryTables::default());
    tables.create_table("Main", &["Record ID".to_string()]).unwrap();
    let index = RecordIndex::new(tables.clone(), 2);
    for i in 0..5 {
      tables.append_row("Main", &[format!("rec-{i}")]).unwrap();
    }
    assert_eq!(index.locate(None, "Main", "rec-4").unwrap(), Some(6));
  }
}
