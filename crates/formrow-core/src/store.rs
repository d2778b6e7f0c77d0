//! Collaborator traits.
//!
//! The consistency layer is written against these four narrow contracts so
//! any row-oriented store can sit underneath it. Every call is synchronous;
//! rows and columns are 1-based and row 1 holds the header.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// A table cell. Stores hold text only.
pub type Cell = String;

/// One physical row.
pub type Row = Vec<Cell>;

/// Row and column extent of a table, header included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
  pub rows: usize,
  pub cols: usize,
}

// ─── Tabular store ───────────────────────────────────────────────────────────

/// Row-oriented tabular storage with rectangular range I/O.
pub trait TabularStore: Send + Sync {
  fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

  /// Create `table` with `header` as its first row.
  fn create_table(&self, table: &str, header: &[Cell]) -> Result<(), StoreError>;

  /// Number of stored rows, header included (0 for an empty table).
  fn row_count(&self, table: &str) -> Result<usize, StoreError>;

  fn col_count(&self, table: &str) -> Result<usize, StoreError>;

  fn shape(&self, table: &str) -> Result<Shape, StoreError> {
    Ok(Shape {
      rows: self.row_count(table)?,
      cols: self.col_count(table)?,
    })
  }

  /// Read a `height × width` block starting at (`row`, `col`). Cells beyond
  /// the stored extent read as empty strings.
  fn get_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    height: usize,
    width: usize,
  ) -> Result<Vec<Row>, StoreError>;

  /// Overwrite a block starting at (`row`, `col`), growing the table as
  /// needed.
  fn set_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    values: &[Row],
  ) -> Result<(), StoreError>;

  /// Append `values` after the last row and return its row number.
  fn append_row(&self, table: &str, values: &[Cell]) -> Result<usize, StoreError>;

  /// First row at or after `first_row` whose cell in `col` equals `needle`
  /// exactly. Backends with a native search primitive override this.
  fn find_exact(
    &self,
    table: &str,
    col: usize,
    first_row: usize,
    needle: &str,
  ) -> Result<Option<usize>, StoreError> {
    scan_exact(self, table, col, first_row, needle)
  }
}

const SCAN_CHUNK_ROWS: usize = 500;

/// Linear exact-match scan of one column, read in chunks.
pub fn scan_exact<T: TabularStore + ?Sized>(
  store: &T,
  table: &str,
  col: usize,
  first_row: usize,
  needle: &str,
) -> Result<Option<usize>, StoreError> {
  let last = store.row_count(table)?;
  let mut start = first_row.max(1);
  while start <= last {
    let height = SCAN_CHUNK_ROWS.min(last - start + 1);
    let chunk = store.get_range(table, start, col, height, 1)?;
    if let Some(offset) = chunk
      .iter()
      .position(|r| r.first().is_some_and(|c| c == needle))
    {
      return Ok(Some(start + offset));
    }
    start += height;
  }
  Ok(None)
}

// ─── Cache, properties, lock ─────────────────────────────────────────────────

/// Key/value cache with per-entry TTL. Entries may vanish at any time.
pub trait KvCache: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
  fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
}

/// Small durable string properties. Read-your-writes within a process,
/// last-write-wins across processes.
pub trait PropertyStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Identifies one acquisition of a lock. Releasing with a token frees the
/// lock only while that acquisition still holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
  pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for LockToken {
  fn from(token: String) -> Self { Self(token) }
}

/// Advisory named lock. Callers proceed without it when acquisition times
/// out.
pub trait AdvisoryLock: Send + Sync {
  /// Wait up to `timeout` for `name`; `Ok(None)` on timeout.
  fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>, StoreError>;
  fn release(&self, name: &str, token: &LockToken) -> Result<(), StoreError>;
}
