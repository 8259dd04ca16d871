//! sidecache: an offline cache and sync agent for client applications.

mod app;
mod cache;
mod config;
mod control;
mod event;
mod fetch;
mod lifecycle;
mod notify;
mod replay;
mod routes;

use clap::Parser;
use color_eyre::Result;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sidecache")]
#[command(about = "Offline cache and sync agent for client applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sidecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: platform data directory)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Override the configured origin
  #[arg(long)]
  origin: Option<String>,
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard keeps the non-blocking writer alive for the process
/// lifetime. Use RUST_LOG to control the level (e.g. RUST_LOG=debug).
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let (writer, guard) = tracing_appender::non_blocking(io::stderr());

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on the command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  info!(origin = %config.origin, version = config.cache.version, "Starting agent");

  let backend = cache::SqliteBackend::open(args.db.as_deref())?;
  let surface = Arc::new(notify::HeadlessSurface);

  let mut agent = app::Agent::new(config, backend, surface)?;
  agent.run().await
}
