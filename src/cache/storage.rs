//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, GenerationRecord, RequestKey, StoredResponse};
use crate::lifecycle::LifecycleState;

/// Trait for cache storage backends.
///
/// Every method is atomic with respect to the others: a reader sees a
/// multi-entry write either completely or not at all.
pub trait CacheStorage: Send + Sync {
  /// Create or update a generation and upsert the given entries into it.
  fn populate_generation(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()>;

  /// Delete every generation, then create `record` populated with `entries`.
  fn replace_all(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()>;

  /// Look up an entry in a generation.
  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Whether a generation holds an entry for the key.
  fn contains(&self, generation: &str, key: &RequestKey) -> Result<bool>;

  /// Write a single entry. Returns false if the generation does not exist.
  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<bool>;

  /// Delete a generation and all of its entries.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Names of all persisted generations, oldest first.
  fn generation_names(&self) -> Result<Vec<String>>;

  /// Metadata for all persisted generations, oldest first.
  fn generations(&self) -> Result<Vec<GenerationRecord>>;

  /// Record the lifecycle state of a generation.
  fn set_state(&self, name: &str, state: LifecycleState) -> Result<()>;

  /// URLs stored in a generation, sorted.
  fn entry_urls(&self, generation: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per generation; lifecycle state survives restarts
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    state TEXT NOT NULL,
    manifest TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request key hash
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn upsert_generation(tx: &Transaction<'_>, record: &GenerationRecord) -> Result<()> {
  let manifest = serde_json::to_string(&record.manifest)
    .map_err(|e| eyre!("Failed to serialize manifest: {}", e))?;

  tx.execute(
    "INSERT INTO generations (name, version, state, manifest, created_at)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT(name) DO UPDATE SET
       version = excluded.version,
       state = excluded.state,
       manifest = excluded.manifest",
    params![
      record.name,
      record.version,
      record.state.as_str(),
      manifest,
      record.created_at.format(DATETIME_FORMAT).to_string()
    ],
  )
  .map_err(|e| eyre!("Failed to store generation {}: {}", record.name, e))?;

  Ok(())
}

fn insert_entry(conn: &Connection, generation: &str, entry: &CacheEntry) -> Result<usize> {
  let headers = serde_json::to_string(&entry.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  // The EXISTS guard keeps a late write from resurrecting a deleted generation
  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (generation, key_hash, method, url, status, headers, body, stored_at)
       SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
       WHERE EXISTS (SELECT 1 FROM generations WHERE name = ?1)",
      params![
        generation,
        entry.key.hash(),
        entry.key.method(),
        entry.key.url(),
        entry.response.status,
        headers,
        entry.response.body,
        entry.response.stored_at.format(DATETIME_FORMAT).to_string()
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key.url(), e))
}

impl CacheStorage for SqliteStorage {
  fn populate_generation(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    upsert_generation(&tx, record)?;
    for entry in entries {
      insert_entry(&tx, &record.name, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn replace_all(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries", [])
      .map_err(|e| eyre!("Failed to clear entries: {}", e))?;
    tx.execute("DELETE FROM generations", [])
      .map_err(|e| eyre!("Failed to clear generations: {}", e))?;

    upsert_generation(&tx, record)?;
    for entry in entries {
      insert_entry(&tx, &record.name, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn contains(&self, generation: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM entries WHERE generation = ? AND key_hash = ?",
        params![generation, key.hash()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", key.url(), e))?;

    Ok(found.is_some())
  }

  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<bool> {
    let conn = self.lock()?;
    Ok(insert_entry(&conn, generation, entry)? > 0)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted > 0)
  }

  fn generation_names(&self) -> Result<Vec<String>> {
    Ok(self.generations()?.into_iter().map(|g| g.name).collect())
  }

  fn generations(&self) -> Result<Vec<GenerationRecord>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT name, version, state, manifest, created_at FROM generations
         ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, version, state, manifest, created_at)| {
        Ok(GenerationRecord {
          state: state.parse()?,
          manifest: serde_json::from_str(&manifest)
            .map_err(|e| eyre!("Failed to deserialize manifest of {}: {}", name, e))?,
          created_at: parse_datetime(&created_at)?,
          name,
          version,
        })
      })
      .collect()
  }

  fn set_state(&self, name: &str, state: LifecycleState) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "UPDATE generations SET state = ? WHERE name = ?",
        params![state.as_str(), name],
      )
      .map_err(|e| eyre!("Failed to update state of {}: {}", name, e))?;

    Ok(())
  }

  fn entry_urls(&self, generation: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE generation = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![generation], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

    Ok(urls)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
