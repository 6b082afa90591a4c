use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the festival REST API
  #[serde(default = "default_api_base_url")]
  pub api_base_url: String,
  /// Cache database location (defaults to $XDG_DATA_HOME/festcache/cache.db)
  pub database_path: Option<PathBuf>,
  #[serde(default = "default_network_timeout_secs")]
  pub network_timeout_secs: u64,
  #[serde(default)]
  pub quota: QuotaConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub shell: ShellConfig,
  #[serde(default)]
  pub monitor: MonitorConfig,
}

fn default_api_base_url() -> String {
  "http://localhost:3000".to_string()
}

fn default_network_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
  /// Storage budget the usage is measured against
  pub budget_bytes: u64,
  /// Usage percentage above which emergency cleanup runs
  pub threshold_percent: f64,
  /// Share of the images partition dropped by emergency cleanup
  pub image_eviction_ratio: f64,
  /// Partitions whose name contains one of these are considered legacy
  pub legacy_markers: Vec<String>,
}

impl Default for QuotaConfig {
  fn default() -> Self {
    Self {
      budget_bytes: 50 * 1024 * 1024,
      threshold_percent: 80.0,
      image_eviction_ratio: 0.3,
      legacy_markers: vec!["old".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// First retry delay after a failed replay
  pub backoff_base_secs: u64,
  /// Upper bound for the retry delay
  pub backoff_max_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      backoff_base_secs: 5,
      backoff_max_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
  /// Routes preloaded into the static partition on warm-up
  pub critical_routes: Vec<String>,
  /// Origins contacted early so later requests skip connection setup
  pub preconnect_origins: Vec<String>,
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      critical_routes: vec![
        "/".to_string(),
        "/manifest.webmanifest".to_string(),
        "/assets/app.js".to_string(),
        "/assets/app.css".to_string(),
      ],
      preconnect_origins: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  pub tick_secs: u64,
  /// Path probed to decide whether the API is reachable
  pub health_path: String,
  /// Run the quota check every N ticks
  pub quota_check_every_ticks: u64,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      tick_secs: 15,
      health_path: "/api/health".to_string(),
      quota_check_every_ticks: 20,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_base_url: default_api_base_url(),
      database_path: None,
      network_timeout_secs: default_network_timeout_secs(),
      quota: QuotaConfig::default(),
      sync: SyncConfig::default(),
      shell: ShellConfig::default(),
      monitor: MonitorConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./festcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/festcache/config.yaml
  ///
  /// Without a file the defaults apply. `FESTCACHE_API_URL` overrides the
  /// API base URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        debug!("no config file found, using defaults");
        Config::default()
      }
    };

    if let Ok(url) = std::env::var("FESTCACHE_API_URL") {
      config.api_base_url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("festcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("festcache").join("config.yaml");
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
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api_base_url)
      .map_err(|e| eyre!("Invalid api_base_url {}: {}", self.api_base_url, e))?;

    if self.quota.budget_bytes == 0 {
      return Err(eyre!("quota.budget_bytes must be greater than 0"));
    }
    if !(0.0..=100.0).contains(&self.quota.threshold_percent) {
      return Err(eyre!("quota.threshold_percent must be between 0 and 100"));
    }
    if !(0.0..=1.0).contains(&self.quota.image_eviction_ratio) {
      return Err(eyre!("quota.image_eviction_ratio must be between 0.0 and 1.0"));
    }
    if self.network_timeout_secs == 0 {
      return Err(eyre!("network_timeout_secs must be greater than 0"));
    }
    if self.monitor.tick_secs == 0 {
      return Err(eyre!("monitor.tick_secs must be greater than 0"));
    }

    Ok(())
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Checks FESTCACHE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("FESTCACHE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
