use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autosave::AutoSaveTimings;
use crate::cache::CacheOptions;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub autosave: AutoSaveConfig,
  pub notifications: NotificationConfig,
  pub logging: LoggingConfig,
  pub demo: DemoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Backend base URL. Without one the demo runs against the simulated backend.
  pub base_url: Option<String>,
  pub timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_ms: 10_000,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_ms: u64,
  pub gc_time_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: 30_000,
      gc_time_ms: 300_000,
    }
  }
}

impl From<&CacheConfig> for CacheOptions {
  fn from(c: &CacheConfig) -> Self {
    CacheOptions {
      stale_time: Duration::from_millis(c.stale_time_ms),
      gc_time: Duration::from_millis(c.gc_time_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub multiplier: f64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      multiplier: 2.0,
      max_delay_ms: 30_000,
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(c: &RetryConfig) -> Self {
    RetryPolicy {
      max_retries: c.max_retries,
      base_delay: Duration::from_millis(c.base_delay_ms),
      multiplier: c.multiplier,
      max_delay: Duration::from_millis(c.max_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
  pub delay_ms: u64,
  /// How long "Saved" stays on screen
  pub saved_display_ms: u64,
  pub timeout_retries: u32,
  pub timeout_retry_delay_ms: u64,
}

impl Default for AutoSaveConfig {
  fn default() -> Self {
    Self {
      delay_ms: 2000,
      saved_display_ms: 2000,
      timeout_retries: 2,
      timeout_retry_delay_ms: 1000,
    }
  }
}

impl From<&AutoSaveConfig> for AutoSaveTimings {
  fn from(c: &AutoSaveConfig) -> Self {
    AutoSaveTimings {
      delay: Duration::from_millis(c.delay_ms),
      saved_display: Duration::from_millis(c.saved_display_ms),
      timeout_retries: c.timeout_retries,
      timeout_retry_delay: Duration::from_millis(c.timeout_retry_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub display_ms: u64,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self { display_ms: 4000 }
  }
}

impl NotificationConfig {
  pub fn display_window(&self) -> Duration {
    Duration::from_millis(self.display_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, merged with RUST_LOG
  pub level: String,
  /// Log file (defaults to $XDG_DATA_HOME/draftsync/draftsync.log)
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
  /// Simulated network latency per request
  pub latency_ms: u64,
  /// Fail every Nth simulated write (0 disables)
  pub fail_every: u32,
}

impl Default for DemoConfig {
  fn default() -> Self {
    Self {
      latency_ms: 250,
      fail_every: 0,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./draftsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/draftsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("draftsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("draftsync").join("config.yaml");
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
    // An empty file deserializes to null rather than an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from the environment.
  ///
  /// Reads DRAFTSYNC_API_TOKEN. The token is optional; requests go out
  /// unauthenticated without it.
  pub fn api_token() -> Option<String> {
    std::env::var("DRAFTSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert!(config.api.base_url.is_none());
    assert_eq!(config.autosave.delay_ms, 2000);
    assert_eq!(RetryPolicy::from(&config.retry), RetryPolicy::default());
    assert_eq!(CacheOptions::from(&config.cache), CacheOptions::default());
    assert_eq!(AutoSaveTimings::from(&config.autosave), AutoSaveTimings::default());
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let config = Config::parse(
      r#"
api:
  base_url: https://lms.example.com/api
autosave:
  delay_ms: 500
demo:
  fail_every: 3
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url.as_deref(), Some("https://lms.example.com/api"));
    assert_eq!(config.api.timeout_ms, 10_000);
    assert_eq!(config.autosave.delay_ms, 500);
    assert_eq!(config.autosave.saved_display_ms, 2000);
    assert_eq!(config.demo.fail_every, 3);
    assert_eq!(config.demo.latency_ms, 250);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::parse("  \n").unwrap();
    assert_eq!(config.notifications.display_ms, 4000);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here/draftsync.yaml")));
    assert!(result.is_err());
  }
}
