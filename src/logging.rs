//! Tracing setup. The terminal belongs to the UI, so logs go to a file.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

fn normalize_level(input: &str) -> String {
  let trimmed = input.trim();
  if trimmed.is_empty() {
    return "info".to_string();
  }
  match trimmed.to_ascii_lowercase().as_str() {
    "trace" => "trace".to_string(),
    "debug" => "debug".to_string(),
    "info" => "info".to_string(),
    "warn" | "warning" => "warn".to_string(),
    "error" => "error".to_string(),
    // Anything else is a full EnvFilter directive string
    _ => trimmed.to_string(),
  }
}

/// Build the filter from the configured level, with RUST_LOG directives
/// appended so they take precedence.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
  let configured = normalize_level(&config.level);
  let from_env = std::env::var("RUST_LOG")
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty());

  let fallback = || EnvFilter::try_new(&configured).unwrap_or_else(|_| EnvFilter::new("info"));
  match from_env {
    Some(env) => EnvFilter::try_new(format!("{},{}", configured, env))
      .or_else(|_| EnvFilter::try_new(&env))
      .unwrap_or_else(|_| fallback()),
    None => fallback(),
  }
}

/// Default log location: $XDG_DATA_HOME/draftsync/draftsync.log
pub fn default_log_path() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("draftsync")
    .join("draftsync.log")
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the program or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let path = config.file.clone().unwrap_or_else(default_log_path);
  let dir = path
    .parent()
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Log path has no file name: {}", path.display()))?;

  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(env_filter(config))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
