//! SQL schema for the formrow SQLite backend.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per logical table. Extents only ever grow.
CREATE TABLE IF NOT EXISTS sheets (
    name        TEXT PRIMARY KEY,
    row_count   INTEGER NOT NULL DEFAULT 0,
    col_count   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

-- Sparse cell storage: empty cells have no row.
CREATE TABLE IF NOT EXISTS cells (
    sheet  TEXT    NOT NULL REFERENCES sheets(name),
    row    INTEGER NOT NULL,   -- 1-based; row 1 is the header
    col    INTEGER NOT NULL,   -- 1-based
    value  TEXT    NOT NULL,
    PRIMARY KEY (sheet, row, col)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS properties (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    expires_at  INTEGER NOT NULL   -- unix millis
);

-- Lease-based advisory locks; an expired lease may be taken over.
CREATE TABLE IF NOT EXISTS locks (
    name        TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    expires_at  INTEGER NOT NULL   -- unix millis
);

CREATE INDEX IF NOT EXISTS cells_value_idx   ON cells(sheet, col, value);
CREATE INDEX IF NOT EXISTS cache_expires_idx ON cache_entries(expires_at);

PRAGMA user_version = 1;
";
