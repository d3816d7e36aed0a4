//! Classifies intercepted requests by caching strategy.

use std::collections::BTreeSet;
use url::{Origin, Url};

use crate::config::CacheConfig;
use crate::net::{Method, Request};

/// Which strategy handles an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Cache-first into the static partition
  Static,
  /// Network-first into the api partition
  Api,
  /// Network-first with page fallbacks
  Navigation,
  /// Stale-while-revalidate into the dynamic partition
  Dynamic,
}

/// Stateless request classifier.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Origin,
  static_extensions: BTreeSet<String>,
  static_prefixes: Vec<String>,
  api_prefix: String,
}

impl Router {
  pub fn new(config: &CacheConfig, origin: &Url) -> Self {
    Self {
      origin: origin.origin(),
      static_extensions: config.static_extensions.clone(),
      static_prefixes: config.static_prefixes.clone(),
      api_prefix: config.api_prefix.clone(),
    }
  }

  /// Route for `request`, or `None` when it must go straight to the network
  /// (non-GET or cross-origin).
  ///
  /// First match wins: static asset, API, navigation, dynamic.
  pub fn classify(&self, request: &Request) -> Option<Route> {
    if request.method != Method::Get || request.url.origin() != self.origin {
      return None;
    }

    let path = request.url.path();
    let route = if self.is_static_asset(path) {
      Route::Static
    } else if path.starts_with(&self.api_prefix) {
      Route::Api
    } else if request.is_navigation() {
      Route::Navigation
    } else {
      Route::Dynamic
    };

    Some(route)
  }

  fn is_static_asset(&self, path: &str) -> bool {
    if self.static_prefixes.iter().any(|p| path.starts_with(p)) {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => self.static_extensions.contains(&ext.to_ascii_lowercase()),
      None => false,
    }
  }
}
