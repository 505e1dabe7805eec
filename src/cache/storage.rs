//! SQLite-backed bucket storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{BucketStorage, BucketSummary, CachedEntry, EntrySummary, StoredResponse};
use crate::request::Request;
use crate::worker::{WorkerRecord, WorkerSlot, WorkerState};

/// SQLite-based bucket storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
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

    Ok(data_dir.join("cartes").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- rowid order doubles as write order for runtime eviction
CREATE TABLE IF NOT EXISTS bucket_entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_key)
);

CREATE INDEX IF NOT EXISTS idx_bucket_entries_runtime
    ON bucket_entries(bucket, pinned);

CREATE TABLE IF NOT EXISTS workers (
    slot TEXT PRIMARY KEY,
    bucket TEXT NOT NULL,
    origin TEXT NOT NULL,
    fallback TEXT NOT NULL,
    manifest_digest TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn insert_entry(
  conn: &Connection,
  bucket: &str,
  request: &Request,
  response: &StoredResponse,
  pinned: bool,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO bucket_entries
         (bucket, request_key, url, status, headers, body, pinned, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        request.cache_key(),
        request.cache_url(),
        response.status,
        headers,
        response.body,
        pinned
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", request.url, e))?;

  Ok(())
}

fn bucket_exists(conn: &Connection, bucket: &str) -> Result<bool> {
  let found = conn
    .query_row("SELECT 1 FROM buckets WHERE name = ?", params![bucket], |_| Ok(()))
    .optional()
    .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;
  Ok(found.is_some())
}

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
  Ok(())
}

impl BucketStorage for SqliteStorage {
  fn open_bucket(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_bucket(&conn, bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM bucket_entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn bucket_summaries(&self) -> Result<Vec<BucketSummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT b.name,
                COUNT(e.request_key),
                COALESCE(SUM(e.pinned), 0),
                COALESCE(SUM(LENGTH(e.body)), 0)
         FROM buckets b
         LEFT JOIN bucket_entries e ON e.bucket = b.name
         GROUP BY b.name
         ORDER BY b.created_at, b.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let summaries = stmt
      .query_map([], |row| {
        Ok(BucketSummary {
          name: row.get(0)?,
          entries: row.get::<_, i64>(1)? as usize,
          pinned: row.get::<_, i64>(2)? as usize,
          bytes: row.get::<_, i64>(3)? as u64,
        })
      })
      .map_err(|e| eyre!("Failed to summarize buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read bucket summary: {}", e))?;

    Ok(summaries)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<EntrySummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, pinned, LENGTH(body), cached_at FROM bucket_entries
         WHERE bucket = ?
         ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, bool>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, String>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(url, status, pinned, bytes, cached_at)| {
        Ok(EntrySummary {
          url,
          status,
          pinned,
          bytes: bytes as u64,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn get(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, pinned, cached_at FROM bucket_entries
         WHERE bucket = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![bucket, request.cache_key()], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, bool>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    match row {
      Some((url, status, headers, body, pinned, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
        Ok(Some(CachedEntry {
          url,
          response: StoredResponse {
            status,
            headers,
            body,
          },
          pinned,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    bucket: &str,
    request: &Request,
    response: &StoredResponse,
    pinned: bool,
  ) -> Result<bool> {
    let conn = self.lock()?;
    if !bucket_exists(&conn, bucket)? {
      return Ok(false);
    }
    insert_entry(&conn, bucket, request, response, pinned)?;
    Ok(true)
  }

  fn put_all(&self, bucket: &str, entries: &[(Request, StoredResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    // A reinstall replaces the manifest set; runtime entries stay
    tx.execute(
      "DELETE FROM bucket_entries WHERE bucket = ? AND pinned = 1",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to clear manifest entries of {}: {}", bucket, e))?;
    for (request, response) in entries {
      insert_entry(&tx, bucket, request, response, true)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn evict_runtime(&self, bucket: &str, keep: usize) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM bucket_entries
         WHERE bucket = ?1 AND pinned = 0 AND rowid NOT IN (
           SELECT rowid FROM bucket_entries
           WHERE bucket = ?1 AND pinned = 0
           ORDER BY rowid DESC
           LIMIT ?2
         )",
        params![bucket, keep as i64],
      )
      .map_err(|e| eyre!("Failed to evict runtime entries of {}: {}", bucket, e))?;

    Ok(removed)
  }

  fn load_worker(&self, slot: WorkerSlot) -> Result<Option<WorkerRecord>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT bucket, origin, fallback, manifest_digest, state, updated_at FROM workers
         WHERE slot = ?",
        params![slot.as_str()],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load {} worker: {}", slot.as_str(), e))?;

    match row {
      Some((bucket, origin, fallback, manifest_digest, state, updated_at)) => {
        Ok(Some(WorkerRecord {
          bucket,
          origin,
          fallback,
          manifest_digest,
          state: state.parse::<WorkerState>()?,
          updated_at: parse_datetime(&updated_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn save_worker(&self, slot: WorkerSlot, record: &WorkerRecord) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO workers
           (slot, bucket, origin, fallback, manifest_digest, state, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          slot.as_str(),
          record.bucket,
          record.origin,
          record.fallback,
          record.manifest_digest,
          record.state.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to save {} worker: {}", slot.as_str(), e))?;
    Ok(())
  }

  fn clear_worker(&self, slot: WorkerSlot) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM workers WHERE slot = ?", params![slot.as_str()])
      .map_err(|e| eyre!("Failed to clear {} worker: {}", slot.as_str(), e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
