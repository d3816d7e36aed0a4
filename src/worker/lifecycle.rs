//! Install and activate phases.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::fmt;

use crate::cache::CacheStorage;
use crate::net::Request;

use super::ServiceWorker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
  #[default]
  Parsed,
  Installing,
  /// Installed and waiting for the previous worker to let go
  Installed,
  Activating,
  Activated,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  /// Precache paths now in the static partition
  pub cached: Vec<String>,
  /// Precache paths that could not be fetched, with the reason
  pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  /// Partitions from older versions that were removed
  pub deleted: Vec<String>,
  /// Windows newly brought under control
  pub claimed: usize,
}

impl<S: CacheStorage> ServiceWorker<S> {
  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    tracing::debug!(from = %*current, to = %state, "worker state");
    *current = state;
  }

  /// Warm the static partition with the precache manifest.
  ///
  /// Each asset is fetched concurrently and independently; one failure never
  /// aborts the install. Finishes by calling `skip_waiting`.
  pub async fn install(&self) -> InstallReport {
    self.set_state(WorkerState::Installing);

    let fetches = self.config.cache.precache.iter().map(|path| async move {
      let outcome = self.precache(path).await;
      (path.clone(), outcome)
    });

    let mut report = InstallReport::default();
    for (path, outcome) in join_all(fetches).await {
      match outcome {
        Ok(()) => report.cached.push(path),
        Err(e) => {
          tracing::warn!(path = %path, "precache failed: {e}");
          report.failed.push((path, e.to_string()));
        }
      }
    }

    tracing::info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "install complete"
    );
    self.set_state(WorkerState::Installed);
    self.skip_waiting().await;
    report
  }

  async fn precache(&self, path: &str) -> Result<()> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid precache path: {}", e))?;
    let request = Request::get(url);

    let response = self.cache.fetch(&request).await?;
    if !response.ok() {
      return Err(eyre!("HTTP {}", response.status));
    }

    self
      .cache
      .storage()
      .put(&self.names.static_assets, &request, &response)
      .map_err(|e| eyre!("Failed to store precache entry: {}", e))
  }

  /// Promote a waiting worker. No-op in any other state.
  pub async fn skip_waiting(&self) -> Option<ActivateReport> {
    if self.state() != WorkerState::Installed {
      tracing::debug!(state = %self.state(), "skip_waiting ignored");
      return None;
    }
    Some(self.activate().await)
  }

  /// Purge partitions from other versions and claim every open window.
  pub async fn activate(&self) -> ActivateReport {
    self.set_state(WorkerState::Activating);

    let mut report = ActivateReport::default();
    match self.cache.storage().keys() {
      Ok(names) => {
        for name in names.into_iter().filter(|n| !self.names.is_current(n)) {
          match self.cache.storage().delete(&name) {
            Ok(_) => report.deleted.push(name),
            Err(e) => tracing::warn!(cache = %name, "failed to delete old cache: {e}"),
          }
        }
      }
      Err(e) => tracing::warn!("failed to list caches: {e}"),
    }

    report.claimed = self.clients.claim();
    self.set_state(WorkerState::Activated);
    tracing::info!(
      deleted = report.deleted.len(),
      claimed = report.claimed,
      version = %self.config.app_version,
      "worker activated"
    );
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheNames;
  use crate::net::Response;
  use crate::testing::{url, TestWorker};

  #[tokio::test]
  async fn test_install_is_best_effort() {
    let t = TestWorker::new();
    t.network.respond(url("/").as_str(), Response::html(200, "<app/>"));
    t.network.respond(url("/offline.html").as_str(), Response::html(200, "offline"));
    t.network.respond(url("/icons/icon.svg").as_str(), Response::new(200, "<svg/>"));
    // /manifest.json falls through to a 404

    let report = t.worker.install().await;

    assert_eq!(report.cached.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/manifest.json");

    let static_name = &t.worker.names().static_assets;
    let partitions = t.storage.partitions().unwrap();
    let warmed = partitions.iter().find(|p| &p.name == static_name).unwrap();
    assert_eq!(warmed.entries, 3);
    assert!(t
      .storage
      .match_in(static_name, &Request::get(url("/manifest.json")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_install_offline_still_activates() {
    let t = TestWorker::new();
    t.network.set_offline(true);

    let report = t.worker.install().await;
    assert!(report.cached.is_empty());
    assert_eq!(report.failed.len(), 4);
    assert_eq!(t.worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_activate_keeps_exactly_current_partitions() {
    let t = TestWorker::new();
    let old = CacheNames::new("app", "v0.9.0");
    let request = Request::get(url("/app.js"));
    let response = Response::new(200, "x");

    for name in old.all().into_iter().chain(t.worker.names().all()) {
      t.storage.put(name, &request, &response).unwrap();
    }
    t.storage.put("third-party", &request, &response).unwrap();

    let report = t.worker.activate().await;

    let mut remaining = t.storage.keys().unwrap();
    remaining.sort();
    let mut current: Vec<String> = t.worker.names().all().iter().map(|s| s.to_string()).collect();
    current.sort();
    assert_eq!(remaining, current);
    assert_eq!(report.deleted.len(), 4);
  }

  #[tokio::test]
  async fn test_activate_claims_open_windows() {
    let t = TestWorker::new();
    t.clients.connect(url("/"));
    t.clients.connect(url("/settings"));

    let report = t.worker.activate().await;
    assert_eq!(report.claimed, 2);
    assert_eq!(t.clients.match_all(false).len(), 2);
  }

  #[tokio::test]
  async fn test_skip_waiting_only_promotes_installed_worker() {
    let t = TestWorker::new();
    assert!(t.worker.skip_waiting().await.is_none());
    assert_eq!(t.worker.state(), WorkerState::Parsed);

    t.worker.install().await;
    assert_eq!(t.worker.state(), WorkerState::Activated);
    assert!(t.worker.skip_waiting().await.is_none());
  }
}
