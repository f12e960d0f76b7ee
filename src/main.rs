mod app;
mod event;
mod ui;

use clap::Parser;
use color_eyre::Result;
use draftsync::config::Config;
use draftsync::logging;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "draftsync")]
#[command(about = "Terminal course admin console with optimistic updates and autosave")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/draftsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL; without one a simulated backend is used
  #[arg(short, long)]
  api: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override backend if specified on command line
  if let Some(api) = args.api {
    config.api.base_url = Some(api);
  }

  let _log_guard = logging::init(&config.logging)?;

  // Initialize and run the app
  let mut app = app::App::new(&config)?;
  app.run().await?;

  Ok(())
}
