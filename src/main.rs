mod app;
mod cache;
mod catalog;
mod config;
mod logging;
mod manifest;
mod net;
mod request;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cartes")]
#[command(about = "Offline cache and request router for a historical map viewer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cartes/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the configured version's bucket from the asset manifest
  Install {
    /// Reinstall even if this version is already active
    #[arg(long)]
    force: bool,
  },
  /// Activate the installed version and purge stale buckets
  Activate,
  /// Show the active version and every bucket
  Status {
    /// List the entries of each bucket
    #[arg(long)]
    entries: bool,
    #[arg(long)]
    json: bool,
  },
  /// Route a single GET request through the cache
  Fetch {
    /// Absolute URL, or a path under the configured origin
    url: String,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List the overlays of the catalog
  Catalog,
  /// Run the caching proxy
  Serve {
    /// Address to listen on (default from config)
    #[arg(short, long)]
    listen: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config)?;

  match args.command {
    Command::Install { force } => app.install(force).await,
    Command::Activate => app.activate().await,
    Command::Status { entries, json } => app.status(entries, json),
    Command::Fetch { url, output } => app.fetch(&url, output.as_deref()).await,
    Command::Catalog => app.catalog().await,
    Command::Serve { listen } => app.serve(listen.as_deref()).await,
  }
}
