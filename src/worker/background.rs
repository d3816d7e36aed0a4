//! Platform-side background sync: remembers tags and fires them on reconnect.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::queue::SyncRegistrar;

use super::event::WorkerEvent;

/// Registered sync tags, fired once each when connectivity returns.
///
/// A registration made while online fires immediately. Tags are coalesced:
/// registering the same tag twice before it fires yields one event.
pub struct BackgroundSync {
  tags: Mutex<BTreeSet<String>>,
  events: mpsc::UnboundedSender<WorkerEvent>,
  online: AtomicBool,
}

impl BackgroundSync {
  pub fn new(events: mpsc::UnboundedSender<WorkerEvent>, online: bool) -> Self {
    Self {
      tags: Mutex::new(BTreeSet::new()),
      events,
      online: AtomicBool::new(online),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Tags waiting for connectivity.
  pub fn pending_tags(&self) -> Vec<String> {
    let tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
    tags.iter().cloned().collect()
  }

  /// Record a connectivity change. Going online fires every waiting tag.
  pub fn set_online(&self, online: bool) -> usize {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if !online || was_online {
      return 0;
    }
    tracing::debug!("connectivity restored");
    self.fire_all()
  }

  fn fire_all(&self) -> usize {
    let tags = {
      let mut waiting = self.tags.lock().unwrap_or_else(|e| e.into_inner());
      std::mem::take(&mut *waiting)
    };

    let mut fired = 0;
    for tag in tags {
      tracing::debug!(tag = %tag, "firing background sync");
      if self.events.send(WorkerEvent::Sync { tag }).is_err() {
        tracing::warn!("worker event loop has stopped");
        break;
      }
      fired += 1;
    }
    fired
  }
}

#[async_trait]
impl SyncRegistrar for BackgroundSync {
  async fn register(&self, tag: &str) -> Result<()> {
    if self.events.is_closed() {
      return Err(eyre!("No active worker to deliver sync '{}'", tag));
    }

    self
      .tags
      .lock()
      .map_err(|e| eyre!("Failed to lock sync tags: {}", e))?
      .insert(tag.to_string());

    if self.is_online() {
      self.fire_all();
    }
    Ok(())
  }

  fn connectivity_changed(&self, online: bool) -> usize {
    self.set_online(online)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sync_tag(event: WorkerEvent) -> String {
    match event {
      WorkerEvent::Sync { tag } => tag,
      other => panic!("unexpected event {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_offline_registration_waits_for_reconnect() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sync = BackgroundSync::new(tx, false);

    sync.register("sync-pending-ops").await.unwrap();
    sync.register("sync-pending-ops").await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(sync.pending_tags(), vec!["sync-pending-ops"]);

    assert_eq!(sync.set_online(true), 1);
    assert_eq!(sync_tag(rx.try_recv().unwrap()), "sync-pending-ops");
    assert!(rx.try_recv().is_err());
    assert!(sync.pending_tags().is_empty());
  }

  #[tokio::test]
  async fn test_online_registration_fires_immediately() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sync = BackgroundSync::new(tx, true);

    sync.register("sync-pending-ops").await.unwrap();
    assert_eq!(sync_tag(rx.try_recv().unwrap()), "sync-pending-ops");
  }

  #[tokio::test]
  async fn test_repeated_online_signal_fires_nothing() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let sync = BackgroundSync::new(tx, true);
    assert_eq!(sync.set_online(true), 0);
    assert_eq!(sync.set_online(false), 0);
  }

  #[tokio::test]
  async fn test_registration_fails_without_worker() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let sync = BackgroundSync::new(tx, true);
    assert!(sync.register("sync-pending-ops").await.is_err());
  }
}
