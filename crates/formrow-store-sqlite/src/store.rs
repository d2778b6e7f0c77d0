//! [`SqliteBackend`]: the SQLite implementation of the collaborator traits.

use std::{
  path::Path,
  sync::{Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

use chrono::Utc;
use formrow_core::{
  StoreError,
  store::{
    AdvisoryLock, Cell, KvCache, LockToken, PropertyStore, Row, TabularStore, scan_exact,
  },
};
use rusqlite::{Connection, OptionalExtension as _, Transaction, params};
use uuid::Uuid;

use crate::{Error, Result, schema::SCHEMA};

const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ─── Backend ─────────────────────────────────────────────────────────────────

/// All four collaborator roles backed by a single SQLite file.
///
/// Cloning is cheap and clones share the connection.
#[derive(Clone)]
pub struct SqliteBackend {
  conn:       Arc<Mutex<Connection>>,
  lock_lease: Duration,
}

impl SqliteBackend {
  /// Open (or create) a backend at `path` and run schema initialisation.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::init(Connection::open(path)?)
  }

  /// Open an in-memory backend, mostly for tests.
  pub fn open_in_memory() -> Result<Self> { Self::init(Connection::open_in_memory()?) }

  fn init(conn: Connection) -> Result<Self> {
    conn.execute_batch(SCHEMA)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(Self {
      conn:       Arc::new(Mutex::new(conn)),
      lock_lease: DEFAULT_LOCK_LEASE,
    })
  }

  /// How long an acquired lock stays valid if its holder never releases it.
  pub fn with_lock_lease(mut self, lease: Duration) -> Self {
    self.lock_lease = lease;
    self
  }

  fn with_conn<T>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<T>,
  ) -> Result<T, StoreError> {
    let mut conn = self.conn.lock().map_err(|_| Error::Poisoned)?;
    f(&mut conn).map_err(StoreError::from)
  }
}

fn now_millis() -> i64 { Utc::now().timestamp_millis() }

fn check_origin(row: usize, col: usize) -> Result<()> {
  if row == 0 || col == 0 {
    return Err(Error::InvalidRange(format!(
      "ranges are 1-based, got row {row} col {col}"
    )));
  }
  Ok(())
}

/// `(row_count, col_count)` of `table`.
fn extent(conn: &Connection, table: &str) -> Result<(usize, usize)> {
  conn
    .query_row(
      "SELECT row_count, col_count FROM sheets WHERE name = ?1",
      params![table],
      |r| Ok((r.get::<_, i64>(0)? as usize, r.get::<_, i64>(1)? as usize)),
    )
    .optional()?
    .ok_or_else(|| Error::TableNotFound(table.to_owned()))
}

/// Write a block of cells and grow the table's extent to cover it. Empty
/// cells are deleted rather than stored.
fn write_cells(
  tx: &Transaction<'_>,
  table: &str,
  row: usize,
  col: usize,
  values: &[Row],
) -> Result<()> {
  if values.is_empty() {
    return Ok(());
  }
  let mut upsert = tx.prepare_cached(
    "INSERT INTO cells (sheet, row, col, value) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (sheet, row, col) DO UPDATE SET value = excluded.value",
  )?;
  let mut delete =
    tx.prepare_cached("DELETE FROM cells WHERE sheet = ?1 AND row = ?2 AND col = ?3")?;

  let mut width = 0;
  for (i, cells) in values.iter().enumerate() {
    for (j, value) in cells.iter().enumerate() {
      let (r, c) = ((row + i) as i64, (col + j) as i64);
      if value.is_empty() {
        delete.execute(params![table, r, c])?;
      } else {
        upsert.execute(params![table, r, c, value])?;
      }
    }
    width = width.max(cells.len());
  }

  let last_row = (row + values.len() - 1) as i64;
  let last_col = (col + width).saturating_sub(1) as i64;
  tx.execute(
    "UPDATE sheets
        SET row_count = MAX(row_count, ?2),
            col_count = MAX(col_count, ?3)
      WHERE name = ?1",
    params![table, last_row, last_col],
  )?;
  Ok(())
}

// ─── Tabular store ───────────────────────────────────────────────────────────

impl TabularStore for SqliteBackend {
  fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
    self.with_conn(|conn| {
      let exists = conn
        .query_row("SELECT 1 FROM sheets WHERE name = ?1", params![table], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
      Ok(exists)
    })
  }

  fn create_table(&self, table: &str, header: &[Cell]) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let inserted = tx.execute(
        "INSERT OR IGNORE INTO sheets (name, row_count, col_count, created_at)
         VALUES (?1, 0, 0, ?2)",
        params![table, Utc::now().to_rfc3339()],
      )?;
      if inserted == 0 {
        return Err(Error::TableExists(table.to_owned()));
      }
      write_cells(&tx, table, 1, 1, &[header.to_vec()])?;
      tx.commit()?;
      tracing::debug!(table, "created table");
      Ok(())
    })
  }

  fn row_count(&self, table: &str) -> Result<usize, StoreError> {
    self.with_conn(|conn| Ok(extent(conn, table)?.0))
  }

  fn col_count(&self, table: &str) -> Result<usize, StoreError> {
    self.with_conn(|conn| Ok(extent(conn, table)?.1))
  }

  fn get_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    height: usize,
    width: usize,
  ) -> Result<Vec<Row>, StoreError> {
    self.with_conn(|conn| {
      check_origin(row, col)?;
      extent(conn, table)?;
      let mut grid = vec![vec![Cell::new(); width]; height];
      if height == 0 || width == 0 {
        return Ok(grid);
      }

      let mut stmt = conn.prepare_cached(
        "SELECT row, col, value FROM cells
          WHERE sheet = ?1 AND row BETWEEN ?2 AND ?3 AND col BETWEEN ?4 AND ?5",
      )?;
      let mut rows = stmt.query(params![
        table,
        row as i64,
        (row + height - 1) as i64,
        col as i64,
        (col + width - 1) as i64,
      ])?;
      while let Some(r) = rows.next()? {
        let (r_idx, c_idx): (i64, i64) = (r.get(0)?, r.get(1)?);
        grid[r_idx as usize - row][c_idx as usize - col] = r.get(2)?;
      }
      Ok(grid)
    })
  }

  fn set_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    values: &[Row],
  ) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      check_origin(row, col)?;
      let tx = conn.transaction()?;
      extent(&tx, table)?;
      write_cells(&tx, table, row, col, values)?;
      tx.commit()?;
      Ok(())
    })
  }

  fn append_row(&self, table: &str, values: &[Cell]) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let row = extent(&tx, table)?.0 + 1;
      write_cells(&tx, table, row, 1, &[values.to_vec()])?;
      // An all-empty row still occupies its position.
      tx.execute(
        "UPDATE sheets SET row_count = MAX(row_count, ?2) WHERE name = ?1",
        params![table, row as i64],
      )?;
      tx.commit()?;
      Ok(row)
    })
  }

  /// Uses the `(sheet, col, value)` index instead of reading the column.
  fn find_exact(
    &self,
    table: &str,
    col: usize,
    first_row: usize,
    needle: &str,
  ) -> Result<Option<usize>, StoreError> {
    // Empty cells are not stored, so blanks can only be found by scanning.
    if needle.is_empty() {
      return scan_exact(self, table, col, first_row, needle);
    }
    self.with_conn(|conn| {
      extent(conn, table)?;
      let row: Option<i64> = conn.query_row(
        "SELECT MIN(row) FROM cells
          WHERE sheet = ?1 AND col = ?2 AND row >= ?3 AND value = ?4",
        params![table, col as i64, first_row as i64, needle],
        |r| r.get(0),
      )?;
      Ok(row.map(|r| r as usize))
    })
  }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

impl KvCache for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    self.with_conn(|conn| {
      let value = conn
        .query_row(
          "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
          params![key, now_millis()],
          |r| r.get(0),
        )
        .optional()?;
      Ok(value)
    })
  }

  fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      let now = now_millis();
      let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
      conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])?;
      conn.execute(
        "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, expires_at],
      )?;
      Ok(())
    })
  }
}

// ─── Properties ──────────────────────────────────────────────────────────────

impl PropertyStore for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    self.with_conn(|conn| {
      let value = conn
        .query_row("SELECT value FROM properties WHERE key = ?1", params![key], |r| r.get(0))
        .optional()?;
      Ok(value)
    })
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO properties (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
      )?;
      Ok(())
    })
  }
}

// ─── Lock ────────────────────────────────────────────────────────────────────

impl SqliteBackend {
  /// Take `name` for `token` if it is free or its lease has run out.
  fn claim(&self, name: &str, token: &LockToken) -> Result<bool, StoreError> {
    let lease = i64::try_from(self.lock_lease.as_millis()).unwrap_or(i64::MAX);
    self.with_conn(|conn| {
      let now = now_millis();
      let tx = conn.transaction()?;
      tx.execute("DELETE FROM locks WHERE name = ?1 AND expires_at <= ?2", params![name, now])?;
      let claimed = tx.execute(
        "INSERT OR IGNORE INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)",
        params![name, token.as_str(), now.saturating_add(lease)],
      )? == 1;
      tx.commit()?;
      Ok(claimed)
    })
  }
}

impl AdvisoryLock for SqliteBackend {
  fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>, StoreError> {
    let token = LockToken::from(Uuid::new_v4().to_string());
    let deadline = Instant::now() + timeout;
    loop {
      if self.claim(name, &token)? {
        return Ok(Some(token));
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
    }
  }

  fn release(&self, name: &str, token: &LockToken) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      conn.execute(
        "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
        params![name, token.as_str()],
      )?;
      Ok(())
    })
  }
}
