//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::{Method, Request, Response};

/// Summary of one partition, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
  pub name: String,
  pub entries: usize,
}

/// Trait for cache storage backends.
///
/// Partitions are named buckets of GET responses keyed by method and URL.
/// Each `put` replaces the entry atomically; concurrent writers to the same
/// key resolve as last write wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Partition names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Drop a partition and every entry in it.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Look up a request in one partition.
  fn match_in(&self, cache_name: &str, request: &Request) -> Result<Option<Response>>;

  /// Look up a request across all partitions, oldest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<Response>>;

  /// Store a response for a GET request, creating the partition if needed.
  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Partition names with their entry counts.
  fn partitions(&self) -> Result<Vec<PartitionInfo>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache storage at `path`.
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

  /// Open a private in-memory cache storage.
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

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
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
-- Named partitions; id order is creation order
CREATE TABLE IF NOT EXISTS cache_partitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Response snapshots
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(entry_key);
"#;

/// Stable, fixed-length key for a request: SHA256 of method and URL
/// without its fragment.
pub fn entry_key(request: &Request) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn ensure_partition(conn: &Connection, cache_name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;
  Ok(())
}

fn decode_response(status: u16, headers: String, body: Vec<u8>) -> Result<Response> {
  let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to decode cached headers: {}", e))?;
  Ok(Response {
    status,
    headers,
    body,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_partition(&conn, cache_name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache_name, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_in(&self, cache_name: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE cache_name = ? AND entry_key = ?",
        params![cache_name, entry_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache_name, e))?;

    row
      .map(|(status, headers, body)| decode_response(status, headers, body))
      .transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body FROM cache_entries e
         INNER JOIN cache_partitions p ON p.name = e.cache_name
         WHERE e.entry_key = ?
         ORDER BY p.id
         LIMIT 1",
        params![entry_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    row
      .map(|(status, headers, body)| decode_response(status, headers, body))
      .transpose()
  }

  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()> {
    if request.method != Method::Get {
      return Err(eyre!(
        "Refusing to cache {} {}: only GET responses are cacheable",
        request.method,
        request.url
      ));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to encode headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_partition(&tx, cache_name)?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, entry_key, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_name,
        entry_key(request),
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn partitions(&self) -> Result<Vec<PartitionInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT p.name, COUNT(e.entry_key) FROM cache_partitions p
         LEFT JOIN cache_entries e ON e.cache_name = p.name
         GROUP BY p.id
         ORDER BY p.id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let partitions = stmt
      .query_map([], |row| {
        let entries: i64 = row.get(1)?;
        Ok(PartitionInfo {
          name: row.get(0)?,
          entries: entries.max(0) as usize,
        })
      })
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache partition: {}", e))?;

    Ok(partitions)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:3000").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_then_match_in_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::new(200, "body").with_header("Content-Type", "text/plain");

    storage.put("static", &get("/app.js"), &response).unwrap();

    let cached = storage.match_in("static", &get("/app.js")).unwrap().unwrap();
    assert_eq!(cached, response);
    assert!(storage.match_in("dynamic", &get("/app.js")).unwrap().is_none());
    assert!(storage.match_in("static", &get("/other.js")).unwrap().is_none());
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("first").unwrap();
    storage.open("second").unwrap();

    storage.put("second", &get("/"), &Response::new(200, "second")).unwrap();
    storage.put("first", &get("/"), &Response::new(200, "first")).unwrap();

    let cached = storage.match_any(&get("/")).unwrap().unwrap();
    assert_eq!(cached.text(), "first");
  }

  #[test]
  fn test_put_overwrites_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("api", &get("/api/items"), &Response::new(200, "old")).unwrap();
    storage.put("api", &get("/api/items"), &Response::new(200, "new")).unwrap();

    let cached = storage.match_in("api", &get("/api/items")).unwrap().unwrap();
    assert_eq!(cached.text(), "new");
    assert_eq!(storage.partitions().unwrap()[0].entries, 1);
  }

  #[test]
  fn test_non_get_requests_are_never_cached() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let post = get("/api/items").with_method(Method::Post);

    assert!(storage.put("api", &post, &Response::new(200, "")).is_err());
    assert!(storage.keys().unwrap().is_empty());
  }

  #[test]
  fn test_fragment_does_not_change_key() {
    assert_eq!(entry_key(&get("/docs")), entry_key(&get("/docs#section")));
    assert_ne!(entry_key(&get("/docs")), entry_key(&get("/docs?page=2")));
  }

  #[test]
  fn test_delete_removes_partition_and_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("old", &get("/"), &Response::new(200, "")).unwrap();
    storage.open("current").unwrap();

    assert!(storage.delete("old").unwrap());
    assert!(!storage.delete("old").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["current"]);
    assert!(storage.match_any(&get("/")).unwrap().is_none());
  }
}
