use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application name, used as the fallback notification title
  pub app_name: String,
  /// Version tag appended to every cache partition name.
  /// Bumping it is the only way to invalidate cached responses.
  pub app_version: String,
  /// Origin governed by the worker (e.g. "http://localhost:3000")
  pub origin: String,
  /// SQLite database path (defaults to $XDG_DATA_HOME/pwa-sync/pwa-sync.db)
  pub database: Option<PathBuf>,
  /// Cache storage path (defaults to caches.db next to the database)
  pub cache_database: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix shared by all partition names
  pub prefix: String,
  /// Assets fetched into the static partition on install
  pub precache: Vec<String>,
  /// File extensions routed to the static partition (case-insensitive)
  #[serde(deserialize_with = "deserialize_extension_set")]
  pub static_extensions: BTreeSet<String>,
  /// Build-output path prefixes routed to the static partition
  pub static_prefixes: Vec<String>,
  pub api_prefix: String,
  pub offline_page: String,
  /// Upper bound for any single network round-trip
  pub network_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Path of the endpoint pending operations are replayed against
  pub endpoint: String,
  /// Background sync tag the worker answers to
  pub tag: String,
  /// Failed replays allowed before an op is dead-lettered
  pub max_retries: u32,
  /// Base delay of the exponential retry backoff
  pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub icon: String,
  pub badge: String,
  pub default_tag: String,
  pub default_body: String,
}

fn deserialize_extension_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "App".to_string(),
      app_version: "v1.0.0".to_string(),
      origin: "http://localhost:3000".to_string(),
      database: None,
      cache_database: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    let extensions = [
      "js", "css", "woff", "woff2", "ttf", "otf", "svg", "png", "jpg", "jpeg", "gif", "webp",
      "avif", "ico",
    ];

    Self {
      prefix: "app".to_string(),
      precache: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
        "/icons/icon.svg".to_string(),
      ],
      static_extensions: extensions.iter().map(|e| e.to_string()).collect(),
      static_prefixes: vec!["/_next/static/".to_string()],
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      network_timeout_secs: 10,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/sync".to_string(),
      tag: "sync-pending-ops".to_string(),
      max_retries: 5,
      retry_backoff_secs: 30,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-192x192.png".to_string(),
      default_tag: "app-notification".to_string(),
      default_body: "New notification".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pwa-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pwa-sync/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pwa-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pwa-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.origin_url()?;
    Ok(config)
  }

  /// Parsed origin the worker governs.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pwa-sync").join("pwa-sync.db"))
  }

  /// Cache storage path; lives beside the database unless set explicitly.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache_database {
      return Ok(path.clone());
    }

    let database = self.database_path()?;
    let dir = database
      .parent()
      .ok_or_else(|| eyre!("Database path has no parent: {}", database.display()))?;
    Ok(dir.join("caches.db"))
  }
}
