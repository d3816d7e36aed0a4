//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::net::{fetch_with_timeout, Network, Request, Response};

use super::result::CacheResult;
use super::storage::CacheStorage;

/// Message carried by the synthesized offline API response
pub const OFFLINE_MESSAGE: &str = "No connection available.";

/// Cache layer that applies a caching strategy to each request.
///
/// Cache writes are best-effort: a failed write is logged and the response
/// is still handed back to the caller.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  /// Upper bound on every network round-trip
  timeout: Duration,
  /// Background revalidations that have not finished yet
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend and network.
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>) -> Self {
    Self {
      storage,
      network,
      timeout: Duration::from_secs(10),
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Set the network timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &dyn Network {
    self.network.as_ref()
  }

  /// Network fetch bounded by the layer's timeout.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    fetch_with_timeout(self.network.as_ref(), request, self.timeout).await
  }

  pub(crate) fn store(&self, cache_name: &str, request: &Request, response: &Response) {
    if let Err(e) = self.storage.put(cache_name, request, response) {
      tracing::warn!(url = %request.url, cache = cache_name, "cache write failed: {e}");
    }
  }

  /// Search every partition; storage errors count as a miss.
  pub(crate) fn lookup(&self, request: &Request) -> Option<Response> {
    match self.storage.match_any(request) {
      Ok(found) => found,
      Err(e) => {
        tracing::warn!(url = %request.url, "cache lookup failed: {e}");
        None
      }
    }
  }

  pub(crate) fn lookup_in(&self, cache_name: &str, request: &Request) -> Option<Response> {
    match self.storage.match_in(cache_name, request) {
      Ok(found) => found,
      Err(e) => {
        tracing::warn!(url = %request.url, cache = cache_name, "cache lookup failed: {e}");
        None
      }
    }
  }

  /// `cache_name` first, then any other partition.
  pub(crate) fn lookup_preferring(&self, cache_name: &str, request: &Request) -> Option<Response> {
    self
      .lookup_in(cache_name, request)
      .or_else(|| self.lookup(request))
  }

  /// Cache-first strategy for static assets.
  ///
  /// 1. Return any cached copy without touching the network
  /// 2. Otherwise fetch, keep a copy of `ok` responses, and return
  ///
  /// Fails only when there is no cached copy and the network is unreachable.
  pub async fn cache_first(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> Result<CacheResult<Response>> {
    if let Some(cached) = self.lookup_preferring(cache_name, request) {
      return Ok(CacheResult::from_cache(cached));
    }

    let response = self.fetch(request).await?;
    if response.ok() {
      self.store(cache_name, request, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Network-first strategy for API requests.
  ///
  /// 1. Try the network; keep a copy of `ok` responses
  /// 2. On network failure, return the cached copy of this exact request
  /// 3. Otherwise synthesize a 503 JSON body signalling offline state
  pub async fn network_first(&self, request: &Request, cache_name: &str) -> CacheResult<Response> {
    match self.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(cache_name, request, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, "network failed, trying cache: {e}");
        match self.lookup_preferring(cache_name, request) {
          Some(cached) => CacheResult::from_cache(cached),
          None => CacheResult::offline(offline_api_response()),
        }
      }
    }
  }

  /// Stale-while-revalidate strategy for everything else.
  ///
  /// A cached copy is returned immediately while a background fetch refreshes
  /// it for next time. Without a cached copy the fetch is awaited; `None`
  /// means the network failed too.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> Option<CacheResult<Response>> {
    if let Some(cached) = self.lookup_in(cache_name, request) {
      self.revalidate_in_background(request.clone(), cache_name.to_string());
      return Some(CacheResult::from_cache(cached));
    }

    match self.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(cache_name, request, &response);
        }
        Some(CacheResult::from_network(response))
      }
      Err(e) => {
        tracing::debug!(url = %request.url, "network failed with nothing cached: {e}");
        None
      }
    }
  }

  fn revalidate_in_background(&self, request: Request, cache_name: String) {
    let layer = self.clone();
    let mut tasks = match self.revalidations.lock() {
      Ok(tasks) => tasks,
      Err(e) => {
        tracing::warn!("revalidation queue poisoned: {e}");
        return;
      }
    };

    // Reap finished revalidations
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      match layer.fetch(&request).await {
        Ok(response) if response.ok() => layer.store(&cache_name, &request, &response),
        Ok(response) => {
          tracing::debug!(url = %request.url, status = response.status, "revalidation not stored")
        }
        Err(e) => tracing::debug!(url = %request.url, "revalidation failed: {e}"),
      }
    });
  }

  /// Wait for every background revalidation to settle.
  pub async fn wait_idle(&self) {
    loop {
      let mut tasks = match self.revalidations.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
      };

      if tasks.is_empty() {
        return;
      }

      while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
          tracing::warn!("revalidation task failed: {e}");
        }
      }
    }
  }
}

/// `{"error":"offline","message":...}` with status 503.
pub fn offline_api_response() -> Response {
  Response::json(
    503,
    &serde_json::json!({ "error": "offline", "message": OFFLINE_MESSAGE }),
  )
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      timeout: self.timeout,
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}
