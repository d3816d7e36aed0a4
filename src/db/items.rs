//! Example domain entity kept in the durable store.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::pending_ops::insert_op_with;
use super::{
  conversion_error, format_timestamp, now, parse_timestamp, Database, NewSyncOp, Operation,
  PendingSyncOp, StoreError,
};

/// Entity type tag used for item ops in the queue
pub const ITEM_ENTITY: &str = "item";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
  #[default]
  Active,
  Inactive,
}

impl ItemStatus {
  fn as_str(&self) -> &'static str {
    match self {
      ItemStatus::Active => "active",
      ItemStatus::Inactive => "inactive",
    }
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown item status '{0}'")]
struct UnknownStatus(String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub status: ItemStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Id of the queued op that has not been confirmed remotely yet
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pending_sync: Option<i64>,
}

impl Item {
  pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: id.into(),
      name: name.into(),
      description: None,
      status: ItemStatus::Active,
      created_at: now,
      updated_at: now,
      pending_sync: None,
    }
  }
}

const ITEM_COLUMNS: &str = "id, name, description, status, created_at, updated_at, pending_sync";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
  let status: String = row.get(3)?;
  let created_at: String = row.get(4)?;
  let updated_at: String = row.get(5)?;

  Ok(Item {
    id: row.get(0)?,
    name: row.get(1)?,
    description: row.get(2)?,
    status: match status.as_str() {
      "active" => ItemStatus::Active,
      "inactive" => ItemStatus::Inactive,
      _ => return Err(conversion_error(3, UnknownStatus(status))),
    },
    created_at: parse_timestamp(4, &created_at)?,
    updated_at: parse_timestamp(5, &updated_at)?,
    pending_sync: row.get(6)?,
  })
}

fn upsert_item(conn: &rusqlite::Connection, item: &Item) -> Result<(), StoreError> {
  conn.execute(
    "INSERT OR REPLACE INTO items (id, name, description, status, created_at, updated_at, pending_sync)
     VALUES (?, ?, ?, ?, ?, ?, ?)",
    params![
      item.id,
      item.name,
      item.description,
      item.status.as_str(),
      format_timestamp(&item.created_at),
      format_timestamp(&item.updated_at),
      item.pending_sync
    ],
  )?;
  Ok(())
}

impl Database {
  pub fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
    let item = conn.query_row(&sql, params![id], item_from_row).optional()?;
    Ok(item)
  }

  /// All items, oldest first.
  pub fn list_items(&self) -> Result<Vec<Item>, StoreError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM items ORDER BY created_at, id", ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
      .query_map([], item_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
  }

  /// Store an item exactly as given, e.g. after a refresh from the server.
  pub fn put_item(&self, item: &Item) -> Result<(), StoreError> {
    let conn = self.lock()?;
    upsert_item(&conn, item)
  }

  /// Optimistic local write: apply `operation` to the local copy and queue
  /// its replay in the same transaction.
  ///
  /// Creates and updates leave the item marked with the new op's id. Deletes
  /// remove the row right away; the queued op carries the last known state.
  pub fn save_item_offline(
    &self,
    item: &Item,
    operation: Operation,
  ) -> Result<(Option<Item>, PendingSyncOp), StoreError> {
    let now = now();
    let mut saved = item.clone();
    saved.updated_at = now;
    saved.pending_sync = None;

    let new_op = NewSyncOp::new(
      ITEM_ENTITY,
      saved.id.clone(),
      operation,
      serde_json::to_value(&saved)?,
    );

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let op = insert_op_with(&tx, &new_op, now)?;
    let stored = match operation {
      Operation::Delete => {
        tx.execute("DELETE FROM items WHERE id = ?", params![saved.id])?;
        None
      }
      Operation::Create | Operation::Update => {
        saved.pending_sync = Some(op.id);
        upsert_item(&tx, &saved)?;
        Some(saved)
      }
    };

    tx.commit()?;
    Ok((stored, op))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_save_marks_item_with_its_op() {
    let db = Database::open_in_memory().unwrap();
    let (saved, op) = db
      .save_item_offline(&Item::new("i1", "First"), Operation::Create)
      .unwrap();

    let saved = saved.unwrap();
    assert_eq!(saved.pending_sync, Some(op.id));
    assert_eq!(op.entity_type, ITEM_ENTITY);
    assert_eq!(op.entity_id, "i1");
    assert_eq!(op.payload["name"], "First");

    let stored = db.get_item("i1").unwrap().unwrap();
    assert_eq!(stored.pending_sync, Some(op.id));
  }

  #[test]
  fn test_confirmed_op_clears_marker() {
    let db = Database::open_in_memory().unwrap();
    let (_, op) = db
      .save_item_offline(&Item::new("i1", "First"), Operation::Create)
      .unwrap();

    db.delete_op(op.id).unwrap();

    let stored = db.get_item("i1").unwrap().unwrap();
    assert_eq!(stored.pending_sync, None);
  }

  #[test]
  fn test_marker_follows_latest_op() {
    let db = Database::open_in_memory().unwrap();
    let (_, first) = db
      .save_item_offline(&Item::new("i1", "First"), Operation::Create)
      .unwrap();

    let mut renamed = db.get_item("i1").unwrap().unwrap();
    renamed.name = "Renamed".to_string();
    let (_, second) = db.save_item_offline(&renamed, Operation::Update).unwrap();

    // Confirming the older op must not clear the newer marker
    db.delete_op(first.id).unwrap();
    let stored = db.get_item("i1").unwrap().unwrap();
    assert_eq!(stored.name, "Renamed");
    assert_eq!(stored.pending_sync, Some(second.id));
  }

  #[test]
  fn test_offline_delete_removes_row_and_queues_op() {
    let db = Database::open_in_memory().unwrap();
    db.put_item(&Item::new("i1", "First")).unwrap();

    let item = db.get_item("i1").unwrap().unwrap();
    let (stored, op) = db.save_item_offline(&item, Operation::Delete).unwrap();

    assert!(stored.is_none());
    assert!(db.get_item("i1").unwrap().is_none());
    assert_eq!(op.operation, Operation::Delete);
    assert_eq!(db.list_pending_ops().unwrap().len(), 1);
  }

  #[test]
  fn test_list_items_is_oldest_first() {
    let db = Database::open_in_memory().unwrap();
    let mut older = Item::new("b", "Older");
    older.created_at = Utc::now() - chrono::Duration::hours(1);
    db.put_item(&Item::new("a", "Newer")).unwrap();
    db.put_item(&older).unwrap();

    let ids: Vec<_> = db.list_items().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["b", "a"]);
  }
}
