use crate::config::Config;

/// The three partitions of one app version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_assets: String,
  pub dynamic: String,
  pub api: String,
}

impl CacheNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{}-static-{}", prefix, version),
      dynamic: format!("{}-dynamic-{}", prefix, version),
      api: format!("{}-api-{}", prefix, version),
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(&config.cache.prefix, &config.app_version)
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_assets, &self.dynamic, &self.api]
  }

  /// Whether `name` survives activation of this version.
  pub fn is_current(&self, name: &str) -> bool {
    self.all().contains(&name)
  }
}
