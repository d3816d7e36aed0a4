//! Page-side glue between the worker, connectivity and the page's event bus.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::queue::SyncQueue;
use crate::worker::{ClientHandle, SyncSummary, WorkerMessage};

/// Events the page's UI listens for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "camelCase")]
pub enum PageEvent {
  BackgroundSyncComplete(SyncSummary),
  ConnectionChange { online: bool },
  /// A new worker finished installing while an older one controls the page
  AppUpdateAvailable,
  /// First install finished; the app now works offline
  AppReadyOffline,
}

pub struct PageBridge {
  queue: SyncQueue,
  events: mpsc::UnboundedSender<PageEvent>,
}

impl PageBridge {
  pub fn new(queue: SyncQueue) -> (Self, mpsc::UnboundedReceiver<PageEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    (Self { queue, events }, rx)
  }

  fn emit(&self, event: PageEvent) {
    if self.events.send(event).is_err() {
      tracing::debug!("page event bus closed");
    }
  }

  pub fn on_worker_message(&self, message: &WorkerMessage) {
    match message {
      WorkerMessage::SyncComplete(summary) => {
        self.emit(PageEvent::BackgroundSyncComplete(summary.clone()))
      }
    }
  }

  /// Same as `on_worker_message` for an unparsed value; anything that is not a
  /// worker message is ignored.
  pub fn on_raw_message(&self, value: &serde_json::Value) {
    if let Some(message) = WorkerMessage::parse(value) {
      self.on_worker_message(&message);
    }
  }

  /// Publish the transition and hand it to the platform's background sync.
  ///
  /// Coming back online also asks for a sync, unless a registration that was
  /// waiting for connectivity just fired.
  pub async fn on_connection_change(&self, online: bool) {
    self.emit(PageEvent::ConnectionChange { online });
    let fired = self.queue.connectivity_changed(online);
    if online && fired == 0 {
      self.queue.request_sync().await;
    }
  }

  pub fn on_worker_installed(&self, has_controller: bool) {
    if has_controller {
      self.emit(PageEvent::AppUpdateAvailable);
    } else {
      self.emit(PageEvent::AppReadyOffline);
    }
  }

  /// Relay everything the worker posts to this window until it disconnects.
  pub async fn forward(&self, mut handle: ClientHandle) {
    while let Some(message) = handle.messages.recv().await {
      self.on_worker_message(&message);
    }
    tracing::debug!(client = handle.id, "worker channel closed");
  }
}
