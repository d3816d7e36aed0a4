//! The service worker engine.
//!
//! A `ServiceWorker` owns the request router and caching strategies and
//! handles every platform event: install, activate, fetch, sync, push,
//! notification clicks and page messages. Collaborators are injected so the
//! same engine runs against a real origin or in-process fakes.

mod background;
mod clients;
mod event;
mod lifecycle;
mod messages;
mod push;
mod router;
mod sync;

pub use background::BackgroundSync;
pub use clients::{ClientHandle, ClientHub, ClientId, ClientInfo};
pub use event::{EventLoop, WorkerEvent};
pub use lifecycle::{ActivateReport, InstallReport, WorkerState};
pub use messages::{ClientMessage, SyncSummary, WorkerMessage};
pub use push::{ClickOutcome, LogNotifier, Notification, NotificationData, Notifier, PushPayload};
pub use router::{Route, Router};

use color_eyre::{eyre::eyre, Report, Result};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheLayer, CacheNames, CacheResult, CacheStorage};
use crate::config::Config;
use crate::db::Database;
use crate::net::{Network, Request, Response};

/// What the worker did with an intercepted request
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not handled; the page's request goes to the network untouched
  Passthrough,
  Respond(CacheResult<Response>),
  /// Neither cache nor network could produce a response
  Failed(Report),
}

pub struct ServiceWorker<S: CacheStorage> {
  config: Arc<Config>,
  origin: Url,
  sync_url: Url,
  names: CacheNames,
  router: Router,
  cache: CacheLayer<S>,
  db: Arc<Database>,
  clients: Arc<ClientHub>,
  notifier: Arc<dyn Notifier>,
  state: Arc<Mutex<WorkerState>>,
  /// Held for the whole of a sync run so runs never overlap
  sync_run: Arc<tokio::sync::Mutex<()>>,
}

impl<S: CacheStorage> ServiceWorker<S> {
  pub fn new(
    config: Arc<Config>,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    db: Arc<Database>,
    clients: Arc<ClientHub>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let sync_url = origin
      .join(&config.sync.endpoint)
      .map_err(|e| eyre!("Invalid sync endpoint '{}': {}", config.sync.endpoint, e))?;

    Ok(Self {
      names: CacheNames::from_config(&config),
      router: Router::new(&config.cache, &origin),
      cache: CacheLayer::new(storage, network).with_timeout(config.cache.network_timeout()),
      origin,
      sync_url,
      db,
      clients,
      notifier,
      state: Arc::new(Mutex::new(WorkerState::default())),
      sync_run: Arc::new(tokio::sync::Mutex::new(())),
      config,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn clients(&self) -> &ClientHub {
    &self.clients
  }

  /// Absolute URL for a same-origin path.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  /// Route an intercepted request to its caching strategy.
  pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
    let Some(route) = self.router.classify(&request) else {
      return FetchOutcome::Passthrough;
    };
    tracing::debug!(url = %request.url, ?route, "fetch");

    match route {
      Route::Static => match self.cache.cache_first(&request, &self.names.static_assets).await {
        Ok(result) => FetchOutcome::Respond(result),
        Err(e) => FetchOutcome::Failed(e),
      },
      Route::Api => FetchOutcome::Respond(self.cache.network_first(&request, &self.names.api).await),
      Route::Navigation => FetchOutcome::Respond(
        self
          .cache
          .navigate(&request, &self.names.dynamic, &self.config.cache.offline_page)
          .await,
      ),
      Route::Dynamic => match self.cache.stale_while_revalidate(&request, &self.names.dynamic).await {
        Some(result) => FetchOutcome::Respond(result),
        None => FetchOutcome::Failed(eyre!("No cached copy of {} and the network failed", request.url)),
      },
    }
  }

  /// What the page would receive for `request`: the worker's answer, or the
  /// plain network response for requests the worker does not handle.
  pub async fn respond(&self, request: Request) -> Result<CacheResult<Response>> {
    match self.handle_fetch(request.clone()).await {
      FetchOutcome::Respond(result) => Ok(result),
      FetchOutcome::Failed(e) => Err(e),
      FetchOutcome::Passthrough => Ok(CacheResult::from_network(self.cache.fetch(&request).await?)),
    }
  }

  /// Handle a message posted by a page. Unknown messages are ignored.
  pub async fn handle_message(&self, source: Option<ClientId>, message: &serde_json::Value) {
    match ClientMessage::parse(message) {
      Some(ClientMessage::SyncNow) => {
        self.sync_pending_ops(source).await;
      }
      Some(ClientMessage::SkipWaiting) => {
        self.skip_waiting().await;
      }
      None => tracing::debug!(?source, "ignoring unknown message"),
    }
  }

  pub async fn dispatch(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install => {
        self.install().await;
      }
      WorkerEvent::Activate => {
        self.activate().await;
      }
      WorkerEvent::Fetch {
        request,
        respond_with,
      } => {
        let outcome = self.handle_fetch(request).await;
        if respond_with.send(outcome).is_err() {
          tracing::debug!("fetch requester went away");
        }
      }
      WorkerEvent::Sync { tag } => {
        self.handle_sync(&tag).await;
      }
      WorkerEvent::Push { data } => {
        self.handle_push(data.as_deref()).await;
      }
      WorkerEvent::NotificationClick { notification } => {
        if let Err(e) = self.handle_notification_click(&notification).await {
          tracing::warn!("notification click failed: {e}");
        }
      }
      WorkerEvent::Message { source, message } => self.handle_message(source, &message).await,
    }
  }

  /// Wait for background revalidations to settle.
  pub async fn wait_idle(&self) {
    self.cache.wait_idle().await;
  }
}

impl<S: CacheStorage> Clone for ServiceWorker<S> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      origin: self.origin.clone(),
      sync_url: self.sync_url.clone(),
      names: self.names.clone(),
      router: self.router.clone(),
      cache: self.cache.clone(),
      db: Arc::clone(&self.db),
      clients: Arc::clone(&self.clients),
      notifier: Arc::clone(&self.notifier),
      state: Arc::clone(&self.state),
      sync_run: Arc::clone(&self.sync_run),
    }
  }
}
