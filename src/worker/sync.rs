//! Replays the pending-op queue against the sync endpoint.

use chrono::Utc;
use color_eyre::{eyre::eyre, Report, Result};
use std::collections::HashSet;
use std::time::Duration;

use crate::cache::CacheStorage;
use crate::db::PendingSyncOp;
use crate::net::Request;

use super::clients::ClientId;
use super::messages::{SyncSummary, WorkerMessage};
use super::ServiceWorker;

/// Why a replay was not confirmed
enum ReplayFailure {
  /// The request never got a response
  Unreachable(Report),
  /// The server answered with a non-2xx status
  Rejected(Report),
}

impl<S: CacheStorage> ServiceWorker<S> {
  /// Platform `sync` event. Tags other than the configured one are ignored.
  pub async fn handle_sync(&self, tag: &str) -> Option<SyncSummary> {
    if tag != self.config.sync.tag {
      tracing::debug!(tag, "ignoring unknown sync tag");
      return None;
    }
    Some(self.sync_pending_ops(None).await)
  }

  /// Drain the queue once and tell every client how it went.
  ///
  /// `requester` is the client that sent `SYNC_NOW`, if any. It gets the
  /// summary as a direct reply and is left out of the broadcast.
  ///
  /// Runs are serialized: a run requested while another is in flight starts
  /// once that one has finished, and sees only what it left behind.
  pub async fn sync_pending_ops(&self, requester: Option<ClientId>) -> SyncSummary {
    let summary = {
      let _run = self.sync_run.lock().await;
      match self.replay_pending().await {
        Ok(count) => SyncSummary::succeeded(count),
        Err(e) => {
          tracing::error!("sync run aborted: {e}");
          SyncSummary::failed(e)
        }
      }
    };

    let message = WorkerMessage::SyncComplete(summary.clone());
    if let Some(id) = requester {
      if !self.clients.post_message(id, message.clone()) {
        tracing::debug!(client = id, "sync requester is gone");
      }
    }
    let notified = self.clients.broadcast(&message, requester);

    tracing::info!(
      count = summary.count,
      success = summary.success,
      notified,
      "sync complete"
    );
    summary
  }

  /// Replay every live op in FIFO order. Returns how many were confirmed.
  ///
  /// Per-op failures are recorded and skipped. Once an entity has an op that
  /// failed or is still backing off, its later ops wait for the next run so
  /// the server never sees them out of order. Only store failures abort.
  async fn replay_pending(&self) -> Result<usize> {
    let ops = self
      .db
      .list_pending_ops()
      .map_err(|e| eyre!("Failed to read pending ops: {}", e))?;

    let base = Duration::from_secs(self.config.sync.retry_backoff_secs);
    let now = Utc::now();
    let mut blocked: HashSet<(String, String)> = HashSet::new();
    let mut synced = 0;

    for op in ops {
      let entity = (op.entity_type.clone(), op.entity_id.clone());
      if blocked.contains(&entity) {
        tracing::debug!(id = op.id, entity_id = %op.entity_id, "held back behind earlier op");
        continue;
      }

      if !op.is_due(now, base) {
        tracing::debug!(id = op.id, retries = op.retry_count, "backing off");
        blocked.insert(entity);
        continue;
      }

      match self.replay(&op).await {
        Ok(()) => {
          self
            .db
            .delete_op(op.id)
            .map_err(|e| eyre!("Failed to remove synced op {}: {}", op.id, e))?;
          synced += 1;
        }
        Err(ReplayFailure::Unreachable(e)) => {
          tracing::warn!(id = op.id, entity_id = %op.entity_id, "sync endpoint unreachable: {e}");
          blocked.insert(entity);
          self
            .db
            .record_unreachable(op.id, &e.to_string())
            .map_err(|e| eyre!("Failed to record failure for op {}: {}", op.id, e))?;
        }
        Err(ReplayFailure::Rejected(e)) => {
          tracing::warn!(id = op.id, entity_id = %op.entity_id, "replay failed: {e}");
          blocked.insert(entity);

          let updated = self
            .db
            .record_failure(op.id, &e.to_string(), self.config.sync.max_retries)
            .map_err(|e| eyre!("Failed to record failure for op {}: {}", op.id, e))?;

          if let Some(updated) = updated.filter(|o| o.is_dead_lettered()) {
            tracing::warn!(
              id = updated.id,
              retries = updated.retry_count,
              "op dead-lettered after exhausting retries"
            );
          }
        }
      }
    }

    Ok(synced)
  }

  async fn replay(&self, op: &PendingSyncOp) -> Result<(), ReplayFailure> {
    let request = Request::post_json(self.sync_url.clone(), &op.request_body())
      .map_err(ReplayFailure::Rejected)?;
    let response = self
      .cache
      .fetch(&request)
      .await
      .map_err(ReplayFailure::Unreachable)?;
    if !response.ok() {
      return Err(ReplayFailure::Rejected(eyre!(
        "Sync endpoint returned HTTP {}",
        response.status
      )));
    }
    Ok(())
  }
}
