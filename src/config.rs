use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use offline_gateway::queue::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Relative request URLs are joined to this
  pub base_url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL probed for reachability (defaults to the backend base URL)
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
      probe_timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, reads are never stored and offline reads always miss
  pub enabled: bool,
  /// Lifetime of a cached read, fixed when it is stored
  pub ttl_secs: u64,
  /// Drop cached reads of a resource after a confirmed write to it
  pub invalidate_on_write: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_secs: 300,
      invalidate_on_write: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Transient replay failures tolerated before dead-lettering
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_secs: u64,
  /// How often to retry a drain while online with writes pending
  pub retry_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff_ms: 500,
      max_backoff_secs: 60,
      retry_interval_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/ogw/gateway.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ogw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ogw/config.yaml
  ///
  /// With `allow_missing`, finding no file yields the defaults.
  pub fn load(explicit_path: Option<&Path>, allow_missing: bool) -> Result<Self> {
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
      None if allow_missing => Ok(Self::default()),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ogw/config.yaml\n\
                 or pass --base-url."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ogw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ogw").join("config.yaml");
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

  pub(crate) fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Parsed backend base URL, if configured.
  pub fn base_url(&self) -> Result<Option<Url>> {
    self
      .backend
      .base_url
      .as_deref()
      .map(|raw| Url::parse(raw).map_err(|e| eyre!("Invalid base_url {:?}: {}", raw, e)))
      .transpose()
  }

  /// URL to probe: `network.probe_url`, else the base URL.
  pub fn probe_url(&self) -> Option<String> {
    self
      .network
      .probe_url
      .clone()
      .or_else(|| self.backend.base_url.clone())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.backend.timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.network.probe_interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.network.probe_timeout_secs.max(1))
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.queue.retry_interval_secs.max(1))
  }

  pub fn cache_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(clamp(self.cache.ttl_secs))
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.queue.max_attempts.max(1),
      initial_backoff: chrono::Duration::milliseconds(clamp(self.queue.initial_backoff_ms)),
      max_backoff: chrono::Duration::seconds(clamp(self.queue.max_backoff_secs)),
    }
  }
}

/// Keep configured durations well inside chrono's range.
fn clamp(value: u64) -> i64 {
  i64::from(u32::try_from(value).unwrap_or(u32::MAX))
}
