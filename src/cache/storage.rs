//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::key::QueryKey;

/// A query result read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedQuery {
  pub key: QueryKey,
  pub data: Value,
  /// When the data was fetched
  pub updated_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the stored result for a key.
  fn load(&self, key: &QueryKey) -> Result<Option<PersistedQuery>>;

  /// Store (or replace) the result for a key.
  fn store(&self, key: &QueryKey, data: &Value, updated_at: DateTime<Utc>) -> Result<()>;

  /// Remove the stored result for a key.
  fn remove(&self, key: &QueryKey) -> Result<()>;

  /// All stored results, most recent first.
  fn list(&self) -> Result<Vec<PersistedQuery>>;

  /// Remove everything. Returns the number of removed results.
  fn clear(&self) -> Result<usize>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _key: &QueryKey) -> Result<Option<PersistedQuery>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &QueryKey, _data: &Value, _updated_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &QueryKey) -> Result<()> {
    Ok(())
  }

  fn list(&self) -> Result<Vec<PersistedQuery>> {
    Ok(Vec::new())
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::Storage(format!("Failed to open in-memory database: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_cache_updated ON query_cache(updated_at);
"#;

impl CacheStorage for SqliteStorage {
  fn load(&self, key: &QueryKey) -> Result<Option<PersistedQuery>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, updated_at FROM query_cache WHERE query_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to read query {}: {}", key, e)))?;

    match row {
      Some((data, updated_at)) => {
        let data = serde_json::from_slice(&data)
          .map_err(|e| Error::Storage(format!("Failed to deserialize query {}: {}", key, e)))?;
        Ok(Some(PersistedQuery {
          key: key.clone(),
          data,
          updated_at: parse_datetime(&updated_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, key: &QueryKey, data: &Value, updated_at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(data)
      .map_err(|e| Error::Storage(format!("Failed to serialize query {}: {}", key, e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_cache (query_hash, query_key, data, updated_at)
         VALUES (?, ?, ?, ?)",
        params![key.cache_hash(), key.to_string(), data, updated_at.to_rfc3339()],
      )
      .map_err(|e| Error::Storage(format!("Failed to store query {}: {}", key, e)))?;

    Ok(())
  }

  fn remove(&self, key: &QueryKey) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM query_cache WHERE query_hash = ?",
        params![key.cache_hash()],
      )
      .map_err(|e| Error::Storage(format!("Failed to remove query {}: {}", key, e)))?;
    Ok(())
  }

  fn list(&self) -> Result<Vec<PersistedQuery>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT query_key, data, updated_at FROM query_cache ORDER BY updated_at DESC")
      .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| Error::Storage(format!("Failed to list queries: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    // Rows that no longer decode are skipped rather than failing the listing
    let entries = rows
      .into_iter()
      .filter_map(|(key, data, updated_at)| {
        Some(PersistedQuery {
          key: key.parse().ok()?,
          data: serde_json::from_slice(&data).ok()?,
          updated_at: parse_datetime(&updated_at).ok()?,
        })
      })
      .collect();

    Ok(entries)
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM query_cache", [])
      .map_err(|e| Error::Storage(format!("Failed to clear cache: {}", e)))
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
