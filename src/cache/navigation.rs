//! Network-first handling for top-level page loads.

use crate::net::{Request, Response};

use super::layer::CacheLayer;
use super::result::CacheResult;
use super::storage::CacheStorage;

/// Last-resort page when nothing usable is cached
pub const OFFLINE_HTML: &str =
  "<html><body><h1>Offline</h1><p>No cached content is available.</p></body></html>";

impl<S: CacheStorage> CacheLayer<S> {
  /// Network-first for navigations; never fails.
  ///
  /// On network failure the fallback tiers are, in order: the cached copy of
  /// this URL, the cached root page (so client-side routes resolve to the app
  /// shell), the cached offline page, and finally a synthesized 503 page.
  pub async fn navigate(
    &self,
    request: &Request,
    cache_name: &str,
    offline_page: &str,
  ) -> CacheResult<Response> {
    match self.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(cache_name, request, &response);
        }
        return CacheResult::from_network(response);
      }
      Err(e) => tracing::debug!(url = %request.url, "navigation offline: {e}"),
    }

    self.navigation_fallback(request, cache_name, offline_page)
  }

  fn navigation_fallback(
    &self,
    request: &Request,
    cache_name: &str,
    offline_page: &str,
  ) -> CacheResult<Response> {
    if let Some(cached) = self.lookup_preferring(cache_name, request) {
      return CacheResult::from_cache(cached);
    }

    for path in ["/", offline_page] {
      let url = match request.url.join(path) {
        Ok(url) => url,
        Err(e) => {
          tracing::warn!(path, "bad fallback path: {e}");
          continue;
        }
      };

      if let Some(cached) = self.lookup(&Request::get(url)) {
        return CacheResult::from_cache(cached);
      }
    }

    CacheResult::offline(Response::html(503, OFFLINE_HTML))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::testing::{url, FakeNetwork};
  use std::sync::Arc;
  use std::time::Duration;

  const OFFLINE_PAGE: &str = "/offline.html";

  fn layer(network: &Arc<FakeNetwork>) -> CacheLayer<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    CacheLayer::new(storage, network.clone()).with_timeout(Duration::from_millis(200))
  }

  #[tokio::test]
  async fn test_online_navigation_is_cached() {
    let network = Arc::new(FakeNetwork::new());
    network.respond(url("/docs").as_str(), Response::html(200, "<p>docs</p>"));
    let layer = layer(&network);
    let request = Request::navigate(url("/docs"));

    let result = layer.navigate(&request, "dynamic", OFFLINE_PAGE).await;
    assert_eq!(result.source, CacheSource::Network);

    network.set_offline(true);
    let offline = layer.navigate(&request, "dynamic", OFFLINE_PAGE).await;
    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.data.text(), "<p>docs</p>");
  }

  #[tokio::test]
  async fn test_fallback_tiers_in_priority_order() {
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);

    for mask in 0..8u8 {
      let layer = layer(&network);
      let (exact, root, offline) = (mask & 1 != 0, mask & 2 != 0, mask & 4 != 0);

      if exact {
        layer.store("dynamic", &Request::get(url("/docs/page")), &Response::html(200, "exact"));
      }
      if root {
        layer.store("dynamic", &Request::get(url("/")), &Response::html(200, "root"));
      }
      if offline {
        layer.store("static", &Request::get(url(OFFLINE_PAGE)), &Response::html(200, "offline"));
      }

      let result = layer
        .navigate(&Request::navigate(url("/docs/page")), "dynamic", OFFLINE_PAGE)
        .await;

      let expected = if exact {
        "exact"
      } else if root {
        "root"
      } else if offline {
        "offline"
      } else {
        OFFLINE_HTML
      };
      assert_eq!(result.data.text(), expected, "mask {mask:03b}");

      if exact || root || offline {
        assert_eq!(result.source, CacheSource::Cache);
      } else {
        assert_eq!(result.source, CacheSource::Offline);
        assert_eq!(result.data.status, 503);
        assert_eq!(result.data.header("content-type"), Some("text/html"));
      }
    }
  }

  #[tokio::test]
  async fn test_exact_tier_prefers_current_partition() {
    let network = Arc::new(FakeNetwork::new());
    let layer = layer(&network);
    let request = Request::navigate(url("/docs"));
    layer.store("app-dynamic-v1", &Request::get(url("/docs")), &Response::html(200, "old"));
    network.respond(url("/docs").as_str(), Response::html(200, "new"));
    layer.navigate(&request, "app-dynamic-v2", OFFLINE_PAGE).await;

    network.set_offline(true);
    let offline = layer.navigate(&request, "app-dynamic-v2", OFFLINE_PAGE).await;
    assert_eq!(offline.data.text(), "new");
  }

  #[tokio::test]
  async fn test_server_error_is_passed_through() {
    let network = Arc::new(FakeNetwork::new());
    network.respond(url("/broken").as_str(), Response::html(500, "oops"));
    let layer = layer(&network);

    let result = layer
      .navigate(&Request::navigate(url("/broken")), "dynamic", OFFLINE_PAGE)
      .await;
    assert_eq!(result.data.status, 500);
    assert_eq!(result.source, CacheSource::Network);
  }
}
