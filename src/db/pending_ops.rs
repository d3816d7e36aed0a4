//! The pending-operation queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{conversion_error, format_timestamp, now, parse_timestamp, Database, StoreError};

/// Longest wait between two replays of the same op
const MAX_RETRY_DELAY_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown operation '{0}' (expected create, update or delete)")]
pub struct UnknownOperation(String);

impl FromStr for Operation {
  type Err = UnknownOperation;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Operation::Create),
      "update" => Ok(Operation::Update),
      "delete" => Ok(Operation::Delete),
      other => Err(UnknownOperation(other.to_string())),
    }
  }
}

/// A mutation waiting to be replayed against the remote sync endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSyncOp {
  pub id: i64,
  pub entity_type: String,
  pub entity_id: String,
  pub operation: Operation,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_attempt_at: Option<DateTime<Utc>>,
  /// Set once the op has used up its retries; it is then skipped by replays
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// The caller-supplied part of a `PendingSyncOp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSyncOp {
  pub entity_type: String,
  pub entity_id: String,
  pub operation: Operation,
  pub payload: serde_json::Value,
}

impl NewSyncOp {
  pub fn new(
    entity_type: impl Into<String>,
    entity_id: impl Into<String>,
    operation: Operation,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      entity_type: entity_type.into(),
      entity_id: entity_id.into(),
      operation,
      payload,
    }
  }
}

/// Body posted to the sync endpoint. Local retry bookkeeping stays local.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestBody<'a> {
  pub id: i64,
  pub entity_type: &'a str,
  pub entity_id: &'a str,
  pub operation: Operation,
  pub payload: &'a serde_json::Value,
  pub created_at: DateTime<Utc>,
}

impl PendingSyncOp {
  pub fn request_body(&self) -> SyncRequestBody<'_> {
    SyncRequestBody {
      id: self.id,
      entity_type: &self.entity_type,
      entity_id: &self.entity_id,
      operation: self.operation,
      payload: &self.payload,
      created_at: self.created_at,
    }
  }

  /// Delay before a failed op may be replayed again: `base * 2^(retries - 1)`,
  /// capped at one hour. Zero for an op that never failed.
  pub fn retry_delay(&self, base: Duration) -> Duration {
    if self.retry_count == 0 {
      return Duration::ZERO;
    }

    let exponent = (self.retry_count - 1).min(20);
    let secs = base
      .as_secs()
      .saturating_mul(1u64 << exponent)
      .min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
  }

  /// Whether the backoff window since the last failed attempt has elapsed.
  pub fn is_due(&self, now: DateTime<Utc>, base: Duration) -> bool {
    let Some(last_attempt) = self.last_attempt_at else {
      return true;
    };

    match chrono::Duration::from_std(self.retry_delay(base)) {
      Ok(delay) => now >= last_attempt + delay,
      Err(_) => false,
    }
  }

  pub fn is_dead_lettered(&self) -> bool {
    self.dead_lettered_at.is_some()
  }
}

const OP_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, created_at, \
   retry_count, last_error, last_attempt_at, dead_lettered_at";

fn op_from_row(row: &Row<'_>) -> rusqlite::Result<PendingSyncOp> {
  let operation: String = row.get(3)?;
  let payload: String = row.get(4)?;
  let created_at: String = row.get(5)?;
  let last_attempt_at: Option<String> = row.get(8)?;
  let dead_lettered_at: Option<String> = row.get(9)?;

  Ok(PendingSyncOp {
    id: row.get(0)?,
    entity_type: row.get(1)?,
    entity_id: row.get(2)?,
    operation: operation
      .parse()
      .map_err(|e| conversion_error(3, e))?,
    payload: serde_json::from_str(&payload).map_err(|e| conversion_error(4, e))?,
    created_at: parse_timestamp(5, &created_at)?,
    retry_count: row.get(6)?,
    last_error: row.get(7)?,
    last_attempt_at: last_attempt_at
      .as_deref()
      .map(|s| parse_timestamp(8, s))
      .transpose()?,
    dead_lettered_at: dead_lettered_at
      .as_deref()
      .map(|s| parse_timestamp(9, s))
      .transpose()?,
  })
}

/// Append an op using an existing connection or transaction.
pub(super) fn insert_op_with(
  conn: &Connection,
  op: &NewSyncOp,
  now: DateTime<Utc>,
) -> Result<PendingSyncOp, StoreError> {
  let payload = serde_json::to_string(&op.payload)?;

  conn.execute(
    "INSERT INTO pending_ops (entity_type, entity_id, operation, payload, created_at, retry_count)
     VALUES (?, ?, ?, ?, ?, 0)",
    params![
      op.entity_type,
      op.entity_id,
      op.operation.as_str(),
      payload,
      format_timestamp(&now)
    ],
  )?;

  Ok(PendingSyncOp {
    id: conn.last_insert_rowid(),
    entity_type: op.entity_type.clone(),
    entity_id: op.entity_id.clone(),
    operation: op.operation,
    payload: op.payload.clone(),
    created_at: now,
    retry_count: 0,
    last_error: None,
    last_attempt_at: None,
    dead_lettered_at: None,
  })
}

impl Database {
  /// Append an op to the queue with `retry_count = 0` and `created_at = now`.
  pub fn insert_op(&self, op: &NewSyncOp) -> Result<PendingSyncOp, StoreError> {
    let conn = self.lock()?;
    insert_op_with(&conn, op, now())
  }

  /// Live ops in enqueue order.
  pub fn list_pending_ops(&self) -> Result<Vec<PendingSyncOp>, StoreError> {
    self.query_ops("WHERE dead_lettered_at IS NULL")
  }

  /// Ops that exhausted their retries, in enqueue order.
  pub fn list_dead_letters(&self) -> Result<Vec<PendingSyncOp>, StoreError> {
    self.query_ops("WHERE dead_lettered_at IS NOT NULL")
  }

  fn query_ops(&self, filter: &str) -> Result<Vec<PendingSyncOp>, StoreError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM pending_ops {} ORDER BY id", OP_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
      .query_map([], op_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
  }

  pub fn get_op(&self, id: i64) -> Result<Option<PendingSyncOp>, StoreError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM pending_ops WHERE id = ?", OP_COLUMNS);
    let op = conn.query_row(&sql, params![id], op_from_row).optional()?;
    Ok(op)
  }

  /// Delete an op after its replay was confirmed, clearing any entity marker
  /// that still points at it. Returns false if the op was already gone.
  pub fn delete_op(&self, id: i64) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let deleted = tx.execute("DELETE FROM pending_ops WHERE id = ?", params![id])?;
    tx.execute(
      "UPDATE items SET pending_sync = NULL WHERE pending_sync = ?",
      params![id],
    )?;

    tx.commit()?;
    Ok(deleted > 0)
  }

  /// Record a failed replay. Once `retry_count` reaches `max_retries` the op
  /// is dead-lettered. Returns the updated op.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    max_retries: u32,
  ) -> Result<Option<PendingSyncOp>, StoreError> {
    let now = format_timestamp(&now());

    {
      let conn = self.lock()?;
      conn.execute(
        "UPDATE pending_ops
         SET retry_count = retry_count + 1,
             last_error = ?1,
             last_attempt_at = ?2,
             dead_lettered_at = CASE WHEN retry_count + 1 >= ?3 THEN ?2 ELSE NULL END
         WHERE id = ?4",
        params![error, now, max_retries, id],
      )?;
    }

    self.get_op(id)
  }

  /// Record a replay that never reached the server. The error is kept for
  /// diagnostics but the retry budget is left alone.
  pub fn record_unreachable(
    &self,
    id: i64,
    error: &str,
  ) -> Result<Option<PendingSyncOp>, StoreError> {
    {
      let conn = self.lock()?;
      conn.execute(
        "UPDATE pending_ops SET last_error = ?1 WHERE id = ?2",
        params![error, id],
      )?;
    }

    self.get_op(id)
  }

  /// Put every dead-lettered op back in the live queue with a fresh retry budget.
  pub fn requeue_dead_letters(&self) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    let count = conn.execute(
      "UPDATE pending_ops
       SET retry_count = 0, last_attempt_at = NULL, dead_lettered_at = NULL
       WHERE dead_lettered_at IS NOT NULL",
      [],
    )?;
    Ok(count)
  }
}
