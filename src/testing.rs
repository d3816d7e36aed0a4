//! In-process fakes for the worker's collaborators.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::db::Database;
use crate::net::{Network, Request, Response};
use crate::queue::SyncRegistrar;
use crate::worker::{ClientHub, Notification, Notifier, ServiceWorker};

pub const ORIGIN: &str = "http://localhost:3000";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Defaults with no retry backoff and a short network bound.
pub fn test_config() -> Config {
  let mut config = Config::default();
  config.origin = ORIGIN.to_string();
  config.cache.network_timeout_secs = 1;
  config.sync.retry_backoff_secs = 0;
  config
}

type Responder = Box<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// Scripted network that records every request it sees.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  responder: Mutex<Option<Responder>>,
  requests: Mutex<Vec<Request>>,
  offline: AtomicBool,
  delay: Mutex<Duration>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `response` for `url`; unknown URLs get a 404.
  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Answer every request with `f`, taking precedence over routes.
  pub fn respond_with<F>(&self, f: F)
  where
    F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
  {
    *self.responder.lock().unwrap() = Some(Box::new(f));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    let target = url(path);
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == target)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }

    if let Some(responder) = self.responder.lock().unwrap().as_ref() {
      return responder(request);
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

/// Records shown notifications; can be told to fail.
#[derive(Default)]
pub struct FakeNotifier {
  pub shown: Mutex<Vec<Notification>>,
  pub closed: Mutex<Vec<Notification>>,
  pub fail: AtomicBool,
}

#[async_trait]
impl Notifier for FakeNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(eyre!("notifications blocked"));
    }
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  async fn close(&self, notification: &Notification) -> Result<()> {
    self.closed.lock().unwrap().push(notification.clone());
    Ok(())
  }
}

/// Records background sync registrations; can be told to fail.
#[derive(Default)]
pub struct FakeRegistrar {
  pub tags: Mutex<Vec<String>>,
  pub fail: AtomicBool,
}

#[async_trait]
impl SyncRegistrar for FakeRegistrar {
  async fn register(&self, tag: &str) -> Result<()> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(eyre!("sync registration rejected"));
    }
    self.tags.lock().unwrap().push(tag.to_string());
    Ok(())
  }
}

/// A worker wired to in-memory storage and fakes, with handles to each.
pub struct TestWorker {
  pub worker: ServiceWorker<SqliteStorage>,
  pub network: Arc<FakeNetwork>,
  pub storage: Arc<SqliteStorage>,
  pub db: Arc<Database>,
  pub clients: Arc<ClientHub>,
  pub notifier: Arc<FakeNotifier>,
}

impl TestWorker {
  pub fn new() -> Self {
    Self::with_config(test_config())
  }

  pub fn with_config(config: Config) -> Self {
    let network = Arc::new(FakeNetwork::new());
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clients = Arc::new(ClientHub::new());
    let notifier = Arc::new(FakeNotifier::default());

    let worker = ServiceWorker::new(
      Arc::new(config),
      storage.clone(),
      network.clone(),
      db.clone(),
      clients.clone(),
      notifier.clone(),
    )
    .unwrap();

    Self {
      worker,
      network,
      storage,
      db,
      clients,
      notifier,
    }
  }
}
