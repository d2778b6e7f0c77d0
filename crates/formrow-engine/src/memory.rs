//! In-process collaborator implementations.
//!
//! Each instance owns its state, so tests (and embedders that want a purely
//! in-memory engine) get isolated stores with an explicit lifetime.

use std::{
  collections::HashMap,
  sync::{
    Condvar, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use formrow_core::{
  StoreError,
  store::{AdvisoryLock, Cell, KvCache, LockToken, PropertyStore, Row, TabularStore},
};

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
  StoreError::Unavailable("lock poisoned".to_owned())
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// Tables held as vectors of rows. Rows may be ragged; reads pad with empty
/// cells.
#[derive(Debug, Default)]
pub struct MemoryTables {
  tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryTables {
  fn with_table<R>(
    &self,
    table: &str,
    f: impl FnOnce(&mut Vec<Row>) -> Result<R, StoreError>,
  ) -> Result<R, StoreError> {
    let mut guard = self.tables.lock().map_err(poisoned)?;
    let rows = guard
      .get_mut(table)
      .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))?;
    f(rows)
  }
}

fn check_origin(row: usize, col: usize) -> Result<(), StoreError> {
  if row == 0 || col == 0 {
    return Err(StoreError::InvalidRange(format!(
      "ranges are 1-based, got row {row} col {col}"
    )));
  }
  Ok(())
}

impl TabularStore for MemoryTables {
  fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
    Ok(self.tables.lock().map_err(poisoned)?.contains_key(table))
  }

  fn create_table(&self, table: &str, header: &[Cell]) -> Result<(), StoreError> {
    let mut guard = self.tables.lock().map_err(poisoned)?;
    if guard.contains_key(table) {
      return Err(StoreError::TableExists(table.to_owned()));
    }
    guard.insert(table.to_owned(), vec![header.to_vec()]);
    Ok(())
  }

  fn row_count(&self, table: &str) -> Result<usize, StoreError> {
    self.with_table(table, |rows| Ok(rows.len()))
  }

  fn col_count(&self, table: &str) -> Result<usize, StoreError> {
    self.with_table(table, |rows| Ok(rows.iter().map(Vec::len).max().unwrap_or(0)))
  }

  fn get_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    height: usize,
    width: usize,
  ) -> Result<Vec<Row>, StoreError> {
    check_origin(row, col)?;
    self.with_table(table, |rows| {
      Ok(
        (row..row + height)
          .map(|r| {
            let stored = rows.get(r - 1);
            (col..col + width)
              .map(|c| {
                stored
                  .and_then(|cells| cells.get(c - 1))
                  .cloned()
                  .unwrap_or_default()
              })
              .collect()
          })
          .collect(),
      )
    })
  }

  fn set_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    values: &[Row],
  ) -> Result<(), StoreError> {
    check_origin(row, col)?;
    self.with_table(table, |rows| {
      for (i, cells) in values.iter().enumerate() {
        let r = row - 1 + i;
        if rows.len() <= r {
          rows.resize(r + 1, Row::new());
        }
        let target = &mut rows[r];
        if target.len() < col - 1 + cells.len() {
          target.resize(col - 1 + cells.len(), Cell::new());
        }
        target[col - 1..col - 1 + cells.len()].clone_from_slice(cells);
      }
      Ok(())
    })
  }

  fn append_row(&self, table: &str, values: &[Cell]) -> Result<usize, StoreError> {
    self.with_table(table, |rows| {
      rows.push(values.to_vec());
      Ok(rows.len())
    })
  }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl KvCache for MemoryCache {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let mut entries = self.entries.lock().map_err(poisoned)?;
    match entries.get(key) {
      Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
      Some(_) => {
        entries.remove(key);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
    self
      .entries
      .lock()
      .map_err(poisoned)?
      .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
    Ok(())
  }
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryProperties {
  values: Mutex<HashMap<String, String>>,
}

impl PropertyStore for MemoryProperties {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.values.lock().map_err(poisoned)?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    self
      .values
      .lock()
      .map_err(poisoned)?
      .insert(key.to_owned(), value.to_owned());
    Ok(())
  }
}

// ─── Lock ────────────────────────────────────────────────────────────────────

/// Named locks shared by every caller holding the same instance.
#[derive(Debug, Default)]
pub struct MemoryLock {
  held:       Mutex<HashMap<String, LockToken>>,
  released:   Condvar,
  next_token: AtomicU64,
}

type Held<'a> = MutexGuard<'a, HashMap<String, LockToken>>;

impl MemoryLock {
  fn wait<'a>(&self, guard: Held<'a>, remaining: Duration) -> Result<Held<'a>, StoreError> {
    self
      .released
      .wait_timeout(guard, remaining)
      .map(|(guard, _)| guard)
      .map_err(poisoned)
  }
}

impl AdvisoryLock for MemoryLock {
  fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>, StoreError> {
    let deadline = Instant::now() + timeout;
    let mut held = self.held.lock().map_err(poisoned)?;
    loop {
      if !held.contains_key(name) {
        let token = LockToken::from(self.next_token.fetch_add(1, Ordering::Relaxed).to_string());
        held.insert(name.to_owned(), token.clone());
        return Ok(Some(token));
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      held = self.wait(held, deadline - now)?;
    }
  }

  fn release(&self, name: &str, token: &LockToken) -> Result<(), StoreError> {
    let mut held = self.held.lock().map_err(poisoned)?;
    if held.get(name) == Some(token) {
      held.remove(name);
      self.released.notify_all();
    }
    Ok(())
  }
}
