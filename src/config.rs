use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{
  CacheConfig, PersistenceAdapter, SqliteSlotStorage, DEFAULT_MAX_ENTRIES, DEFAULT_SAVE_DEBOUNCE,
  DEFAULT_SLOT, DEFAULT_TTL,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheSettings,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Collection endpoint of the task resource
  pub url: String,
  /// Sent as `userId` on create and update
  pub user_id: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: "https://jsonplaceholder.typicode.com/todos".to_string(),
      user_id: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub max_entries: usize,
  pub ttl_secs: u64,
  pub save_debounce_ms: u64,
  /// Do not cache results of fetches that an invalidation overtook
  pub stale_fill_guard: bool,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      max_entries: DEFAULT_MAX_ENTRIES,
      ttl_secs: DEFAULT_TTL.as_secs(),
      save_debounce_ms: DEFAULT_SAVE_DEBOUNCE.as_millis() as u64,
      stale_fill_guard: false,
    }
  }
}

impl CacheSettings {
  pub fn to_cache_config(&self) -> CacheConfig {
    CacheConfig::default()
      .with_max_entries(self.max_entries)
      .with_ttl(Duration::from_secs(self.ttl_secs))
      .with_save_debounce(Duration::from_millis(self.save_debounce_ms))
      .with_stale_fill_guard(self.stale_fill_guard)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Set to false to keep the cache in memory only
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/taskcache/cache.db)
  pub path: Option<PathBuf>,
  /// Snapshots larger than this fail as if storage were full
  pub quota_bytes: Option<usize>,
  pub slot: String,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      quota_bytes: None,
      slot: DEFAULT_SLOT.to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskcache/config.yaml
  ///
  /// Without any file the defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// The API URL, overridable with TASKCACHE_API_URL.
  pub fn api_url(&self) -> String {
    std::env::var("TASKCACHE_API_URL").unwrap_or_else(|_| self.api.url.clone())
  }

  /// Open the configured durable storage.
  ///
  /// Storage that is disabled or cannot be opened yields an adapter in
  /// unavailable mode; the cache then works in memory only.
  pub fn persistence(&self) -> PersistenceAdapter {
    if !self.storage.enabled {
      return PersistenceAdapter::unavailable();
    }

    let path = match self.storage.path.clone() {
      Some(path) => path,
      None => match SqliteSlotStorage::default_path() {
        Ok(path) => path,
        Err(e) => {
          warn!(error = %e, "No location for cache database");
          return PersistenceAdapter::unavailable();
        }
      },
    };

    match SqliteSlotStorage::open(&path, self.storage.quota_bytes) {
      Ok(storage) => PersistenceAdapter::new(Arc::new(storage), self.storage.slot.clone()),
      Err(e) => {
        warn!(error = %e, "Could not open cache database");
        PersistenceAdapter::unavailable()
      }
    }
  }
}
