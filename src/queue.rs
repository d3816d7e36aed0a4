//! Page-side API over the pending-operation queue.
//!
//! Enqueueing is a local durable write and never depends on connectivity.
//! After each write the queue asks the platform for a background sync; when
//! the platform has no such facility the ops wait for the next manual flush.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;

use crate::db::{Database, Item, NewSyncOp, Operation, PendingSyncOp, StoreError};

/// Platform facility that wakes the worker once connectivity returns.
#[async_trait]
pub trait SyncRegistrar: Send + Sync {
  async fn register(&self, tag: &str) -> Result<()>;

  /// Connectivity changed. Returns how many waiting registrations fired.
  fn connectivity_changed(&self, _online: bool) -> usize {
    0
  }
}

/// Durable, ordered record of mutations not yet confirmed remotely.
#[derive(Clone)]
pub struct SyncQueue {
  db: Arc<Database>,
  /// `None` when the platform has no background sync
  registrar: Option<Arc<dyn SyncRegistrar>>,
  tag: String,
}

impl SyncQueue {
  pub fn new(db: Arc<Database>, tag: impl Into<String>) -> Self {
    Self {
      db,
      registrar: None,
      tag: tag.into(),
    }
  }

  pub fn with_registrar(mut self, registrar: Arc<dyn SyncRegistrar>) -> Self {
    self.registrar = Some(registrar);
    self
  }

  pub fn supports_background_sync(&self) -> bool {
    self.registrar.is_some()
  }

  /// Append an op and request a background sync.
  ///
  /// Only storage failures are returned; `StoreError::StorageFull` means the
  /// mutation was not saved even locally.
  pub async fn enqueue(&self, op: NewSyncOp) -> Result<PendingSyncOp, StoreError> {
    let pending = self.db.insert_op(&op)?;
    tracing::debug!(
      id = pending.id,
      entity_type = %pending.entity_type,
      entity_id = %pending.entity_id,
      operation = %pending.operation,
      "queued sync op"
    );

    self.request_sync().await;
    Ok(pending)
  }

  /// Save an item locally and queue its replay in one step.
  pub async fn save_item(
    &self,
    item: &Item,
    operation: Operation,
  ) -> Result<(Option<Item>, PendingSyncOp), StoreError> {
    let saved = self.db.save_item_offline(item, operation)?;
    self.request_sync().await;
    Ok(saved)
  }

  /// All live ops in replay (FIFO) order.
  pub fn list_pending(&self) -> Result<Vec<PendingSyncOp>, StoreError> {
    self.db.list_pending_ops()
  }

  /// Delete one op after its remote replay was confirmed.
  pub fn remove(&self, id: i64) -> Result<bool, StoreError> {
    self.db.delete_op(id)
  }

  pub fn list_dead_letters(&self) -> Result<Vec<PendingSyncOp>, StoreError> {
    self.db.list_dead_letters()
  }

  /// Give dead-lettered ops a fresh retry budget and request a sync.
  pub async fn requeue_dead_letters(&self) -> Result<usize, StoreError> {
    let count = self.db.requeue_dead_letters()?;
    if count > 0 {
      self.request_sync().await;
    }
    Ok(count)
  }

  /// Tell the platform facility about a connectivity change.
  pub fn connectivity_changed(&self, online: bool) -> usize {
    self
      .registrar
      .as_ref()
      .map_or(0, |registrar| registrar.connectivity_changed(online))
  }

  /// Best-effort background sync registration.
  pub async fn request_sync(&self) {
    let Some(registrar) = &self.registrar else {
      return;
    };

    if let Err(e) = registrar.register(&self.tag).await {
      tracing::debug!(tag = %self.tag, "background sync registration failed: {e}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeRegistrar;
  use serde_json::json;
  use std::sync::atomic::Ordering;

  fn queue() -> (SyncQueue, Arc<FakeRegistrar>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let registrar = Arc::new(FakeRegistrar::default());
    let queue = SyncQueue::new(db, "sync-pending-ops").with_registrar(registrar.clone());
    (queue, registrar)
  }

  #[tokio::test]
  async fn test_enqueue_registers_background_sync() {
    let (queue, registrar) = queue();

    let op = queue
      .enqueue(NewSyncOp::new("item", "i1", Operation::Update, json!({"name": "X"})))
      .await
      .unwrap();

    assert_eq!(op.retry_count, 0);
    assert_eq!(*registrar.tags.lock().unwrap(), vec!["sync-pending-ops"]);
    assert_eq!(queue.list_pending().unwrap(), vec![op]);
  }

  #[tokio::test]
  async fn test_enqueue_succeeds_when_registration_fails() {
    let (queue, registrar) = queue();
    registrar.fail.store(true, Ordering::SeqCst);

    queue
      .enqueue(NewSyncOp::new("item", "i1", Operation::Create, json!({})))
      .await
      .unwrap();
    assert_eq!(queue.list_pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_enqueue_without_background_sync() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let queue = SyncQueue::new(db, "sync-pending-ops");
    assert!(!queue.supports_background_sync());

    queue
      .enqueue(NewSyncOp::new("item", "i1", Operation::Create, json!({})))
      .await
      .unwrap();
    assert_eq!(queue.list_pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_list_is_fifo_and_remove_is_targeted() {
    let (queue, _) = queue();
    let mut ids = Vec::new();
    for entity in ["a", "b", "c"] {
      let op = queue
        .enqueue(NewSyncOp::new("item", entity, Operation::Create, json!({})))
        .await
        .unwrap();
      ids.push(op.id);
    }

    assert!(queue.remove(ids[1]).unwrap());
    let remaining: Vec<_> = queue.list_pending().unwrap().iter().map(|o| o.id).collect();
    assert_eq!(remaining, vec![ids[0], ids[2]]);
  }
}
