//! Channel-fed event loop that drives a worker.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::cache::CacheStorage;
use crate::net::Request;

use super::clients::ClientId;
use super::push::Notification;
use super::{FetchOutcome, ServiceWorker};

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  /// Intercepted request; the outcome goes back on `respond_with`
  Fetch {
    request: Request,
    respond_with: oneshot::Sender<FetchOutcome>,
  },
  /// Background sync fired for `tag`
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  NotificationClick { notification: Notification },
  /// Raw message posted by a page
  Message {
    source: Option<ClientId>,
    message: serde_json::Value,
  },
}

impl WorkerEvent {
  fn is_lifecycle(&self) -> bool {
    matches!(self, WorkerEvent::Install | WorkerEvent::Activate)
  }
}

/// Event loop that feeds a worker from a channel
pub struct EventLoop {
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventLoop {
  /// Create the loop and the sender used to post events to it
  pub fn new() -> (mpsc::UnboundedSender<WorkerEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }

  /// Dispatch events until every sender is dropped.
  ///
  /// Lifecycle events run one at a time in arrival order. All other events
  /// run concurrently, and the loop does not return until each of them and
  /// every background revalidation has settled.
  pub async fn run<S: CacheStorage>(mut self, worker: ServiceWorker<S>) {
    let mut tasks = JoinSet::new();

    while let Some(event) = self.next().await {
      while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
      }

      if event.is_lifecycle() {
        worker.dispatch(event).await;
        continue;
      }

      let worker = worker.clone();
      tasks.spawn(async move { worker.dispatch(event).await });
    }

    while let Some(joined) = tasks.join_next().await {
      log_join(joined);
    }
    worker.wait_idle().await;
    tracing::debug!("event loop drained");
  }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    tracing::error!("worker event task failed: {e}");
  }
}
