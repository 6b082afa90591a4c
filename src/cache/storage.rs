//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::net::Response;

/// A response stored in a cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
  pub url: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Partitions are named, isolated namespaces. Entries are ordered by
/// insertion; re-writing a URL counts as a new insertion.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store (or supersede) an entry.
  fn put(&self, partition: &str, entry: &StoredEntry) -> Result<()>;

  /// Get an entry by URL.
  fn get(&self, partition: &str, url: &str) -> Result<Option<StoredEntry>>;

  /// Delete a single entry. Returns whether it existed.
  fn delete(&self, partition: &str, url: &str) -> Result<bool>;

  /// Entry URLs, oldest insertion first.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// Create an empty partition if it does not exist.
  fn open_partition(&self, partition: &str) -> Result<()>;

  /// All known partition names.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Approximate bytes held by the storage.
  fn usage_bytes(&self) -> Result<u64>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("festcache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Read a value from the key/value table.
  pub fn get_value(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  /// Write a value to the key/value table.
  pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq is global and only grows; it gives insertion order within a partition
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    url TEXT NOT NULL,
    seq INTEGER NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq
    ON cache_entries(partition, seq);

CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn put(&self, partition: &str, entry: &StoredEntry) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (partition, url, seq, status, content_type, body, cached_at)
         VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries), ?, ?, ?, ?)",
        params![
          partition,
          entry.url,
          entry.response.status,
          entry.response.content_type,
          entry.response.body,
          entry.cached_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", entry.url, partition, e))?;

    Ok(())
  }

  fn get(&self, partition: &str, url: &str) -> Result<Option<StoredEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, content_type, body, cached_at FROM cache_entries
         WHERE partition = ? AND url = ?",
        params![partition, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", url, partition, e))?;

    match row {
      Some((status, content_type, body, cached_at)) => Ok(Some(StoredEntry {
        url: url.to_string(),
        response: Response {
          status,
          content_type,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn delete(&self, partition: &str, url: &str) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND url = ?",
        params![partition, url],
      )
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", url, partition, e))?;
    Ok(deleted > 0)
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))
  }

  fn open_partition(&self, partition: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.conn()?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to clear partition {}: {}", partition, e))?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    Ok(deleted > 0)
  }

  fn usage_bytes(&self) -> Result<u64> {
    let conn = self.conn()?;

    let entries: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(body) + LENGTH(CAST(url AS BLOB))), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure cache entries: {}", e))?;

    let values: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_store",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure stored values: {}", e))?;

    Ok((entries + values).max(0) as u64)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
