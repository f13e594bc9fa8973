use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_MAX_PENDING;
use crate::sync::{SyncOptions, DEFAULT_CONCURRENCY, DEFAULT_REPLAY_TIMEOUT};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend (e.g., "https://xyz.supabase.co")
  pub url: String,
  /// Id of the signed-in user; every queued write is attributed to it
  pub user_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Targets replayed in parallel during a sync pass
  pub concurrency: usize,
  pub replay_timeout_secs: u64,
  pub probe_timeout_secs: u64,
  /// Queue length beyond which offline writes are refused
  pub max_pending: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      concurrency: DEFAULT_CONCURRENCY,
      replay_timeout_secs: DEFAULT_REPLAY_TIMEOUT.as_secs(),
      probe_timeout_secs: 5,
      max_pending: DEFAULT_MAX_PENDING,
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions {
      concurrency: self.concurrency.max(1),
      replay_timeout: Duration::from_secs(self.replay_timeout_secs),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lineup.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lineup/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/lineup/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("lineup.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lineup").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.backend.user_id.trim().is_empty() {
      return Err(eyre!("backend.user_id must not be empty"));
    }
    Ok(config)
  }

  /// Get the backend API key from the environment.
  ///
  /// Checks LINEUP_API_KEY.
  pub fn get_api_key() -> Result<String> {
    std::env::var("LINEUP_API_KEY")
      .map_err(|_| eyre!("Backend API key not found. Set LINEUP_API_KEY environment variable."))
  }

  /// Get the user's access token from the environment.
  ///
  /// Checks LINEUP_ACCESS_TOKEN. Callers fall back to the API key.
  pub fn get_access_token() -> Result<String> {
    std::env::var("LINEUP_ACCESS_TOKEN")
      .map_err(|_| eyre!("Access token not found. Set LINEUP_ACCESS_TOKEN environment variable."))
  }
}
