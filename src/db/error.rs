use thiserror::Error;

/// Errors raised by the durable store.
///
/// `StorageFull` is kept apart so a caller can tell the user a mutation was
/// not saved even locally.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage exhausted: {0}")]
  StorageFull(String),

  #[error("database lock poisoned")]
  LockPoisoned,

  #[error("failed to encode record: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(failure, _)
        if failure.code == rusqlite::ErrorCode::DiskFull =>
      {
        StoreError::StorageFull(err.to_string())
      }
      _ => StoreError::Sqlite(err),
    }
  }
}
