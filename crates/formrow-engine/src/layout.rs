//! Main-table layout and the row codec.
//!
//! Every destination table starts with the fixed metadata columns from
//! [`META_COLUMNS`], followed by one column per form field. The header only
//! ever grows: new fields append columns, removed fields leave theirs.
//!
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision;
//! `Data Version` is a decimal integer.

use chrono::{DateTime, SecondsFormat, Utc};
use formrow_core::{
  form::{Form, META_COLUMNS},
  record::{DEFAULT_LANGUAGE, FieldValue, Record, Values},
  store::{Cell, Row, TabularStore},
  StoreError,
};

use crate::{Error, Result};

pub const HEADER_ROW: usize = 1;
pub const FIRST_DATA_ROW: usize = 2;

pub const COL_ID: usize = 1;
pub const COL_FORM_KEY: usize = 2;
pub const COL_LANGUAGE: usize = 3;
pub const COL_STATUS: usize = 4;
pub const COL_CREATED_AT: usize = 5;
pub const COL_UPDATED_AT: usize = 6;
pub const COL_DATA_VERSION: usize = 7;
pub const COL_PDF_URL: usize = 8;
pub const META_WIDTH: usize = META_COLUMNS.len();

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_timestamp(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s.trim())
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

// ─── Stored row ──────────────────────────────────────────────────────────────

/// A main-table row decoded as far as its contents allow. Rows written
/// outside this layer may lack any of the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
  pub id:           Option<String>,
  pub form_key:     String,
  pub language:     String,
  pub status:       String,
  pub created_at:   Option<DateTime<Utc>>,
  pub updated_at:   Option<DateTime<Utc>>,
  pub data_version: Option<u64>,
  pub pdf_url:      Option<String>,
  pub values:       Values,
}

impl StoredRow {
  /// Convert into a [`Record`]. Rows without an id have no record identity
  /// yet and yield `None`.
  pub fn into_record(self) -> Option<Record> {
    let id = self.id?;
    let created_at = self
      .created_at
      .or(self.updated_at)
      .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let updated_at = self.updated_at.unwrap_or(created_at).max(created_at);
    Some(Record {
      id,
      form_key: self.form_key,
      language: if self.language.is_empty() {
        DEFAULT_LANGUAGE.to_owned()
      } else {
        self.language
      },
      values: self.values,
      status: self.status,
      created_at,
      updated_at,
      data_version: self.data_version.unwrap_or(0),
      pdf_url: self.pdf_url,
    })
  }
}

/// The metadata cells of `record`, in column order.
pub fn meta_cells(record: &Record) -> Row {
  vec![
    record.id.clone(),
    record.form_key.clone(),
    record.language.clone(),
    record.status.clone(),
    encode_timestamp(record.created_at),
    encode_timestamp(record.updated_at),
    record.data_version.to_string(),
    record.pdf_url.clone().unwrap_or_default(),
  ]
}

// ─── Layout ──────────────────────────────────────────────────────────────────

/// Header of a destination table, mapping column names to positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
  table:  String,
  header: Vec<String>,
}

impl TableLayout {
  /// Read the layout of an existing table. `None` if the table is absent.
  pub fn load(tables: &dyn TabularStore, table: &str) -> Result<Option<Self>> {
    if !tables.table_exists(table)? {
      return Ok(None);
    }
    let header = read_header(tables, table)?;
    let layout = Self { table: table.to_owned(), header };
    layout.check()?;
    Ok(Some(layout))
  }

  /// Load the table's layout, creating the table or appending columns for
  /// fields the header does not have yet.
  pub fn ensure(tables: &dyn TabularStore, form: &Form) -> Result<Self> {
    let table = form.destination.as_str();
    if !tables.table_exists(table)? {
      let header: Row = META_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(form.fields.iter().cloned())
        .collect();
      match tables.create_table(table, &header) {
        Ok(()) => {
          tracing::info!(table, "created destination table");
          return Ok(Self { table: table.to_owned(), header });
        }
        // Lost a creation race; fall through and extend what the winner made.
        Err(StoreError::TableExists(_)) => {}
        Err(e) => return Err(e.into()),
      }
    }

    let mut header = read_header(tables, table)?;
    if header.is_empty() {
      header = META_COLUMNS.iter().map(|c| c.to_string()).collect();
      tables.set_range(table, HEADER_ROW, 1, &[header.clone()])?;
    }
    let mut layout = Self { table: table.to_owned(), header };
    layout.check()?;

    let missing: Row = form
      .fields
      .iter()
      .filter(|f| layout.column(f).is_none())
      .cloned()
      .collect();
    if !missing.is_empty() {
      let first_new = layout.width() + 1;
      tables.set_range(table, HEADER_ROW, first_new, &[missing.clone()])?;
      tracing::info!(table, columns = ?missing, "extended table header");
      layout.header.extend(missing);
    }
    Ok(layout)
  }

  fn check(&self) -> Result<()> {
    for (i, expected) in META_COLUMNS.iter().enumerate() {
      let found = self.header.get(i).map(String::as_str).unwrap_or("");
      if found != *expected {
        return Err(Error::LayoutMismatch {
          table:  self.table.clone(),
          detail: format!("column {} is {found:?}, expected {expected:?}", i + 1),
        });
      }
    }
    Ok(())
  }

  pub fn table(&self) -> &str { &self.table }

  pub fn header(&self) -> &[String] { &self.header }

  pub fn width(&self) -> usize { self.header.len() }

  /// 1-based position of the column named `name`.
  pub fn column(&self, name: &str) -> Option<usize> {
    self.header.iter().position(|h| h == name).map(|i| i + 1)
  }

  /// Full-width row for `record`. Values for fields without a column are
  /// dropped.
  pub fn encode(&self, record: &Record) -> Row {
    let mut row = meta_cells(record);
    row.resize(self.width(), Cell::new());
    for (field, value) in &record.values {
      if let Some(col) = self.column(field).filter(|c| *c > META_WIDTH) {
        row[col - 1] = value.to_cell();
      }
    }
    row
  }

  pub fn decode(&self, row: &[Cell]) -> StoredRow {
    let cell = |col: usize| row.get(col - 1).map(|c| c.trim()).unwrap_or("");
    let non_empty = |col: usize| Some(cell(col).to_owned()).filter(|c| !c.is_empty());

    let values = self
      .header
      .iter()
      .enumerate()
      .skip(META_WIDTH)
      .filter(|(_, name)| !name.is_empty())
      .filter_map(|(i, name)| {
        let raw = row.get(i).map(String::as_str).unwrap_or("");
        FieldValue::from_cell(raw).map(|v| (name.clone(), v))
      })
      .collect();

    StoredRow {
      id: non_empty(COL_ID),
      form_key: cell(COL_FORM_KEY).to_owned(),
      language: cell(COL_LANGUAGE).to_owned(),
      status: cell(COL_STATUS).to_owned(),
      created_at: decode_timestamp(cell(COL_CREATED_AT)),
      updated_at: decode_timestamp(cell(COL_UPDATED_AT)),
      data_version: cell(COL_DATA_VERSION).parse().ok(),
      pdf_url: non_empty(COL_PDF_URL),
      values,
    }
  }

  /// Read and decode one physical row.
  pub fn read_row(&self, tables: &dyn TabularStore, row: usize) -> Result<StoredRow> {
    let cells = tables.get_range(&self.table, row, 1, 1, self.width())?;
    Ok(self.decode(cells.first().map(Vec::as_slice).unwrap_or(&[])))
  }
}

fn read_header(tables: &dyn TabularStore, table: &str) -> Result<Row> {
  let cols = tables.col_count(table)?;
  if cols == 0 {
    return Ok(Row::new());
  }
  let mut header = tables
    .get_range(table, HEADER_ROW, 1, 1, cols)?
    .into_iter()
    .next()
    .unwrap_or_default();
  while header.last().is_some_and(|c| c.is_empty()) {
    header.pop();
  }
  Ok(header)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use formrow_core::form::FormConfig;

  use super::*;
  use crate::memory::MemoryTables;

  fn form(fields: &[&str]) -> Form {
    Form::try_from(FormConfig {
      form_key:    "lunch".into(),
      destination: "Orders".into(),
      fields:      fields.iter().map(|f| f.to_string()).collect(),
      dedup_rules: vec![],
    })
    .unwrap()
  }

  fn record() -> Record {
    let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    Record {
      id:           "r-1".into(),
      form_key:     "lunch".into(),
      language:     "en".into(),
      values:       Values::from([
        ("DISH".to_string(), FieldValue::from("Soup")),
        ("SIDES".to_string(), FieldValue::List(vec!["bread".into()])),
      ]),
      status:       "Submitted".into(),
      created_at:   ts,
      updated_at:   ts,
      data_version: 3,
      pdf_url:      None,
    }
  }

  #[test]
  fn ensure_creates_then_extends_header() {
    let tables = MemoryTables::default();
    let layout = TableLayout::ensure(&tables, &form(&["DISH"])).unwrap();
    assert_eq!(layout.width(), META_WIDTH + 1);

    let layout = TableLayout::ensure(&tables, &form(&["DISH", "SIDES"])).unwrap();
    assert_eq!(layout.column("SIDES"), Some(META_WIDTH + 2));

    // Removing a field leaves its column in place.
    let layout = TableLayout::ensure(&tables, &form(&["SIDES"])).unwrap();
    assert_eq!(layout.column("DISH"), Some(META_WIDTH + 1));
  }

  #[test]
  fn encode_then_decode_preserves_record() {
    let tables = MemoryTables::default();
    let layout = TableLayout::ensure(&tables, &form(&["DISH", "SIDES"])).unwrap();
    let rec = record();
    let row = layout.encode(&rec);
    assert_eq!(row.len(), layout.width());
    assert_eq!(layout.decode(&row).into_record(), Some(rec));
  }

  #[test]
  fn row_without_id_has_no_record() {
    let tables = MemoryTables::default();
    let layout = TableLayout::ensure(&tables, &form(&["DISH"])).unwrap();
    let mut row = vec![String::new(); layout.width()];
    row[META_WIDTH] = "Stew".into();
    let stored = layout.decode(&row);
    assert_eq!(stored.values["DISH"], FieldValue::from("Stew"));
    assert!(stored.into_record().is_none());
  }

  #[test]
  fn foreign_header_is_rejected() {
    let tables = MemoryTables::default();
    tables
      .create_table("Orders", &["Name".to_string(), "Dish".to_string()])
      .unwrap();
    assert!(matches!(
      TableLayout::load(&tables, "Orders"),
      Err(Error::LayoutMismatch { .. })
    ));
  }
}
