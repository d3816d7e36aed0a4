//! Durable store: domain entities plus the queue of pending sync operations.

mod error;
mod items;
mod pending_ops;
pub mod schema;

pub use error::StoreError;
pub use items::{Item, ItemStatus, ITEM_ENTITY};
pub use pending_ops::{NewSyncOp, Operation, PendingSyncOp, SyncRequestBody, UnknownOperation};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Database connection wrapper shared by the page side and the worker
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Apply every migration newer than the stored schema version
  fn run_migrations(&self) -> Result<()> {
    let mut conn = self.lock()?;

    let current: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    for (index, sql) in schema::MIGRATIONS
      .iter()
      .enumerate()
      .skip(current.max(0) as usize)
    {
      let version = index + 1;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin migration {}: {}", version, e))?;
      tx.execute_batch(sql)
        .map_err(|e| eyre!("Failed to run migration {}: {}", version, e))?;
      tx.pragma_update(None, "user_version", version as i64)
        .map_err(|e| eyre!("Failed to record schema version {}: {}", version, e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit migration {}: {}", version, e))?;

      tracing::debug!(version, "applied durable store migration");
    }

    Ok(())
  }

  /// Current schema version
  pub fn schema_version(&self) -> Result<usize> {
    let conn = self.lock()?;
    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;
    Ok(version.max(0) as usize)
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Current time at the precision timestamps are stored with
fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically
fn format_timestamp(at: &DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| conversion_error(column, e))
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_reach_latest_version() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.schema_version().unwrap(), schema::MIGRATIONS.len());
  }

  #[test]
  fn test_reopening_does_not_rerun_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let db = Database::open(&path).unwrap();
      db.insert_op(&NewSyncOp::new(
        "item",
        "i1",
        Operation::Create,
        serde_json::json!({}),
      ))
      .unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.schema_version().unwrap(), schema::MIGRATIONS.len());
    assert_eq!(db.list_pending_ops().unwrap().len(), 1);
  }
}
