use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{BucketStorage, EntrySummary, SqliteStorage};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::net::{Fetcher, HttpFetcher};
use crate::request::Request;
use crate::server::{self, CacheRouter};
use crate::worker::{Registration, WorkerSpec, WorkerState};

/// Command handlers over one configured registration.
pub struct App {
  config: Config,
  storage: Arc<SqliteStorage>,
  fetcher: Arc<HttpFetcher>,
  registration: Arc<CacheRouter>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
    let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
    let registration = Registration::restore(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      config.cache.max_runtime_entries,
    )?;

    Ok(Self {
      config,
      storage,
      fetcher,
      registration: Arc::new(registration),
    })
  }

  /// Configured worker spec, plus the catalog's own thumbnails and source
  /// documents as optional assets when the catalog can be fetched.
  async fn worker_spec(&self) -> Result<WorkerSpec> {
    let mut spec = self.config.worker_spec()?;

    let Some(catalog_url) = self.config.catalog_url()? else {
      return Ok(spec);
    };

    match self.fetcher.fetch(&Request::get(catalog_url.clone())).await {
      Ok(response) if response.is_success() => match Catalog::parse(&response.body) {
        Ok(catalog) => spec
          .manifest
          .extend_optional(catalog.first_party_assets(&spec.origin)),
        Err(e) => warn!(url = %catalog_url, error = %e, "ignoring unreadable catalog"),
      },
      Ok(response) => {
        warn!(url = %catalog_url, status = response.status, "catalog unavailable")
      }
      Err(e) => warn!(url = %catalog_url, error = %e, "catalog unreachable"),
    }

    Ok(spec)
  }

  pub async fn install(&self, force: bool) -> Result<()> {
    let spec = self.worker_spec().await?;
    let report = self.registration.install(&spec, force).await?;

    if report.up_to_date {
      println!("{} is already active (use --force to reinstall)", report.bucket);
      return Ok(());
    }

    println!("installed {}: {} assets", report.bucket, report.stored);
    for path in &report.skipped {
      println!("  skipped optional {}", path);
    }
    match (&report.activation, report.state) {
      (Some(activation), _) => {
        println!("activated {}", activation.bucket);
        for name in &activation.purged {
          println!("  purged {}", name);
        }
      }
      (None, WorkerState::Waiting) => println!("waiting to activate (run `cartes activate`)"),
      (None, _) => {}
    }

    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    let report = self.registration.activate().await?;
    println!("active: {}", report.bucket);
    for name in &report.purged {
      println!("  purged {}", name);
    }
    for name in &report.failed {
      println!("  could not purge {} (will retry on next activation)", name);
    }
    Ok(())
  }

  pub fn status(&self, entries: bool, json: bool) -> Result<()> {
    let report = self.registration.status()?;

    if json {
      let out = serde_json::to_string_pretty(&report)
        .map_err(|e| eyre!("Failed to serialize status: {}", e))?;
      println!("{}", out);
      return Ok(());
    }

    match &report.active {
      Some(active) => println!("active:  {} ({})", active.bucket, active.origin),
      None => println!("active:  none"),
    }
    if let Some(pending) = &report.pending {
      println!("pending: {} [{}]", pending.bucket, pending.state);
    }
    let configured = self.config.cache.bucket_name();
    if report.active.as_ref().map(|a| a.bucket.as_str()) != Some(configured.as_str()) {
      println!("configured version {} is not active", configured);
    }

    println!();
    for bucket in &report.buckets {
      println!(
        "{:<32} {:>5} entries ({} pinned) {:>10} bytes",
        bucket.name, bucket.entries, bucket.pinned, bucket.bytes
      );
      if entries {
        for entry in self.storage.entries(&bucket.name)? {
          print_entry(&entry);
        }
      }
    }

    Ok(())
  }

  /// Route one GET request and write the body to `output` (or stdout).
  pub async fn fetch(&self, target: &str, output: Option<&Path>) -> Result<()> {
    let url = self.resolve(target)?;
    let result = self.registration.route(&Request::get(url.clone())).await?;

    eprintln!(
      "{} {} {} ({})",
      result.response.status,
      result.source.as_str(),
      url,
      result.response.header("content-type").unwrap_or("no content type")
    );

    match output {
      Some(path) => std::fs::write(path, &result.response.body)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
      None => std::io::stdout()
        .write_all(&result.response.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?,
    }

    Ok(())
  }

  /// List the overlays of the catalog, routed like any other request so it
  /// works offline once cached.
  pub async fn catalog(&self) -> Result<()> {
    let url = self
      .config
      .catalog_url()?
      .ok_or_else(|| eyre!("No catalog configured"))?;

    let result = self.registration.route(&Request::get(url.clone())).await?;
    if !result.response.is_success() {
      return Err(eyre!(
        "Catalog {} unavailable (HTTP {}, {})",
        url,
        result.response.status,
        result.source.as_str()
      ));
    }

    let catalog = Catalog::parse(&result.response.body)?;
    for overlay in catalog.overlays() {
      println!(
        "{:<12} {:<40} opacity {:.2} {}",
        overlay.id,
        overlay.display_name(),
        overlay.default_opacity,
        if overlay.default_visible { "visible" } else { "hidden" }
      );
      println!("             {}", overlay.info_title());
      if let Some(meta) = &overlay.meta {
        println!("             {}", meta);
      }
      println!("             tiles: {}", overlay.tile_url);
      if let Some(doc) = &overlay.source_document {
        println!("             source: {}", doc);
      }
    }

    Ok(())
  }

  /// Install the configured version if needed, then serve. A failed install
  /// leaves the previously active version serving.
  pub async fn serve(&self, listen: Option<&str>) -> Result<()> {
    match self.install_quietly().await {
      Ok(state) => info!(state = %state, "configured version ready"),
      Err(e) => match self.registration.active_bucket().await {
        Some(bucket) => warn!(error = %e, bucket = %bucket, "install failed, keeping active version"),
        None => warn!(error = %e, "install failed and no version is active; proxying without cache"),
      },
    }

    let listen = listen.unwrap_or(self.config.server.listen.as_str());
    server::serve(
      Arc::clone(&self.registration),
      self.config.origin_url()?,
      listen,
    )
    .await
  }

  async fn install_quietly(&self) -> Result<WorkerState> {
    let spec = self.worker_spec().await?;
    let report = self.registration.install(&spec, false).await?;
    Ok(report.state)
  }

  /// Absolute URLs are used as-is; anything else is a path under the origin.
  fn resolve(&self, target: &str) -> Result<Url> {
    match Url::parse(target) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .config
        .origin_url()?
        .join(target.trim_start_matches('/'))
        .map_err(|e| eyre!("Invalid path '{}': {}", target, e)),
      Err(e) => Err(eyre!("Invalid URL '{}': {}", target, e)),
    }
  }
}

fn print_entry(entry: &EntrySummary) {
  println!(
    "  {} {} {:>10} {}{}",
    entry.status,
    entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
    entry.bytes,
    entry.url,
    if entry.pinned { "" } else { " (runtime)" }
  );
}
