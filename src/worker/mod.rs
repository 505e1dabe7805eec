//! One deployed version of the offline cache: install, activation cleanup and
//! request routing over its bucket.

mod lifecycle;
mod registration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BucketStorage, CacheLayer, RouteResult};
use crate::manifest::AssetManifest;
use crate::net::Fetcher;
use crate::request::{classify, Party, Request};

pub use lifecycle::{WorkerRecord, WorkerSlot, WorkerState};
pub use registration::{Registration, StatusReport};

/// Explicit configuration of one worker version.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
  /// Bucket name, embedding the version counter
  pub bucket: String,
  pub origin: Url,
  pub manifest: AssetManifest,
  /// Offline fallback document; must be a required manifest entry
  pub fallback: Url,
  pub max_runtime_entries: Option<usize>,
  /// Activate as soon as install succeeds
  pub skip_waiting: bool,
}

/// Outcome of an install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub bucket: String,
  /// State the version ended up in
  pub state: WorkerState,
  pub stored: usize,
  /// Optional assets that could not be fetched
  pub skipped: Vec<String>,
  /// Already the active version with the same manifest; nothing was fetched
  pub up_to_date: bool,
  /// Set when the install went on to activate immediately
  pub activation: Option<ActivationReport>,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
  pub bucket: String,
  pub purged: Vec<String>,
  /// Stale buckets whose deletion failed; left for the next activation
  pub failed: Vec<String>,
}

/// A worker version bound to its bucket.
pub struct CacheWorker<S: BucketStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  origin: Url,
  manifest: AssetManifest,
  manifest_digest: String,
  layer: CacheLayer<S, F>,
}

impl<S: BucketStorage, F: Fetcher> CacheWorker<S, F> {
  pub fn new(spec: &WorkerSpec, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      spec.bucket.clone(),
      spec.fallback.clone(),
    )
    .with_runtime_limit(spec.max_runtime_entries);

    Self {
      storage,
      fetcher,
      origin: spec.origin.clone(),
      manifest_digest: spec.manifest.digest(),
      manifest: spec.manifest.clone(),
      layer,
    }
  }

  /// Rebuild a worker from its persisted record. The manifest itself is not
  /// persisted; a restored worker can route and purge but not reinstall.
  pub fn from_record(
    record: &WorkerRecord,
    storage: Arc<S>,
    fetcher: Arc<F>,
    max_runtime_entries: Option<usize>,
  ) -> Result<Self> {
    let origin = Url::parse(&record.origin)
      .map_err(|e| eyre!("Invalid origin '{}' in worker record: {}", record.origin, e))?;
    let fallback = Url::parse(&record.fallback)
      .map_err(|e| eyre!("Invalid fallback '{}' in worker record: {}", record.fallback, e))?;

    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      record.bucket.clone(),
      fallback,
    )
    .with_runtime_limit(max_runtime_entries);

    Ok(Self {
      storage,
      fetcher,
      origin,
      manifest: AssetManifest::default(),
      manifest_digest: record.manifest_digest.clone(),
      layer,
    })
  }

  pub fn bucket(&self) -> &str {
    self.layer.bucket()
  }

  pub fn manifest_digest(&self) -> &str {
    &self.manifest_digest
  }

  pub fn record(&self, state: WorkerState) -> WorkerRecord {
    WorkerRecord {
      bucket: self.bucket().to_string(),
      origin: self.origin.to_string(),
      fallback: self.layer.fallback_url().to_string(),
      manifest_digest: self.manifest_digest.clone(),
      state,
      updated_at: Utc::now(),
    }
  }

  /// Open the bucket and populate it with every manifest entry.
  ///
  /// All manifest fetches run concurrently. A required entry that fails
  /// (unreachable or non-success status) fails the whole install and nothing
  /// is written; optional entries are skipped with a warning.
  pub async fn install(&self) -> Result<InstallReport> {
    let bucket = self.bucket();
    if self.manifest.is_empty() {
      return Err(eyre!("Worker for {} has no manifest to install", bucket));
    }
    self.storage.open_bucket(bucket)?;

    let assets = self.manifest.resolve(&self.origin)?;
    debug!(bucket, entries = self.manifest.len(), assets = assets.len(), "fetching manifest");
    let fetches = assets.iter().map(|asset| async move {
      let request = Request::get(asset.url.clone());
      let outcome = match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(format!("HTTP {}", response.status)),
        Err(e) => Err(e.to_string()),
      };
      (asset, request, outcome)
    });

    let mut entries = Vec::with_capacity(assets.len());
    let mut skipped = Vec::new();
    let mut failures = Vec::new();

    for (asset, request, outcome) in join_all(fetches).await {
      match outcome {
        Ok(response) => {
          debug!(url = %asset.url, bytes = response.body.len(), "fetched manifest asset");
          entries.push((request, response));
        }
        Err(reason) if asset.optional => {
          warn!(url = %asset.url, reason = %reason, "skipping optional manifest asset");
          skipped.push(asset.path.clone());
        }
        Err(reason) => failures.push(format!("{} ({})", asset.path, reason)),
      }
    }

    if !failures.is_empty() {
      return Err(eyre!(
        "Install of {} failed: {} required asset(s) unavailable: {}",
        bucket,
        failures.len(),
        failures.join(", ")
      ));
    }

    self.storage.put_all(bucket, &entries)?;
    info!(bucket, stored = entries.len(), skipped = skipped.len(), "installed");

    Ok(InstallReport {
      bucket: bucket.to_string(),
      state: WorkerState::Waiting,
      stored: entries.len(),
      skipped,
      up_to_date: false,
      activation: None,
    })
  }

  /// Delete every bucket except this worker's own. Individual delete
  /// failures are logged and reported, not fatal.
  pub fn purge_stale_buckets(&self) -> Result<ActivationReport> {
    let current = self.bucket();
    let mut report = ActivationReport {
      bucket: current.to_string(),
      ..Default::default()
    };

    for name in self.storage.bucket_names()? {
      if name == current {
        continue;
      }
      match self.storage.delete_bucket(&name) {
        Ok(_) => {
          info!(bucket = %name, "purged stale bucket");
          report.purged.push(name);
        }
        Err(e) => {
          warn!(bucket = %name, error = %e, "failed to purge stale bucket");
          report.failed.push(name);
        }
      }
    }

    Ok(report)
  }

  /// Route a request: cache-first for the application's own origin,
  /// network-first for everything else.
  pub async fn route(&self, request: &Request) -> RouteResult {
    if !request.is_cacheable() {
      return self.layer.passthrough(request).await;
    }

    let party = classify(&request.url, &self.origin);
    let result = match party {
      Party::First => self.layer.cache_first(request).await,
      Party::Third => self.layer.network_first(request).await,
    };

    debug!(
      url = %request.url,
      party = ?party,
      source = result.source.as_str(),
      status = result.response.status,
      "routed"
    );
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::manifest::ManifestEntry;
  use crate::net::fake::FakeFetcher;

  const ORIGIN: &str = "https://maps.example.org/";

  fn spec(bucket: &str, manifest: AssetManifest) -> WorkerSpec {
    let origin = Url::parse(ORIGIN).unwrap();
    WorkerSpec {
      bucket: bucket.to_string(),
      fallback: origin.join("/offline.html").unwrap(),
      origin,
      manifest,
      max_runtime_entries: None,
      skip_waiting: false,
    }
  }

  fn site() -> FakeFetcher {
    FakeFetcher::new()
      .with("https://maps.example.org/index.html", "<html>")
      .with("https://maps.example.org/app.js", "init()")
      .with("https://maps.example.org/offline.html", "offline")
  }

  #[tokio::test]
  async fn test_install_populates_bucket() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manifest = AssetManifest::required(["/index.html", "/app.js", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::new(site()));

    let report = worker.install().await.unwrap();
    assert_eq!(report.stored, 3);
    assert_eq!(report.state, WorkerState::Waiting);
    assert_eq!(storage.entries("v1").unwrap().len(), 3);
    assert!(storage.entries("v1").unwrap().iter().all(|e| e.pinned));
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manifest = AssetManifest::required(["/index.html", "/app.js", "/styles.css", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::new(site()));

    let err = worker.install().await.unwrap_err();
    assert!(err.to_string().contains("/styles.css"));
    assert_eq!(storage.entries("v1").unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_install_fails_when_required_asset_unreachable() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = site();
    fetcher.fail("https://maps.example.org/app.js");
    let manifest = AssetManifest::required(["/index.html", "/app.js", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::new(fetcher));

    assert!(worker.install().await.is_err());
    assert_eq!(storage.entries("v1").unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_install_skips_missing_optional_assets() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manifest = AssetManifest::new(vec![
      ManifestEntry::required("/index.html"),
      ManifestEntry::optional("/assets/img/plan6_thumb.jpg"),
      ManifestEntry::required("/offline.html"),
    ]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::new(site()));

    let report = worker.install().await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(report.skipped, vec!["/assets/img/plan6_thumb.jpg"]);
  }

  #[tokio::test]
  async fn test_unreachable_fallback_fails_install_even_if_listed_optional() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = site();
    fetcher.fail("https://maps.example.org/offline.html");
    let mut manifest = AssetManifest::new(vec![
      ManifestEntry::required("/index.html"),
      ManifestEntry::optional("offline.html"),
    ]);
    manifest.ensure_required("/offline.html");
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::new(fetcher));

    let err = worker.install().await.unwrap_err();
    assert!(err.to_string().contains("offline.html"));
    assert_eq!(storage.entries("v1").unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_restored_worker_cannot_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(site());
    let manifest = AssetManifest::required(["/index.html", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::clone(&fetcher));
    let record = worker.record(WorkerState::Active);

    let restored = CacheWorker::from_record(&record, Arc::clone(&storage), fetcher, None).unwrap();
    assert!(restored.install().await.is_err());
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_purge_keeps_only_current_bucket() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.open_bucket("v0").unwrap();
    storage.open_bucket("v1").unwrap();
    storage.open_bucket("v2").unwrap();
    let worker = CacheWorker::new(
      &spec("v2", AssetManifest::default()),
      Arc::clone(&storage),
      Arc::new(FakeFetcher::new()),
    );

    let report = worker.purge_stale_buckets().unwrap();
    assert_eq!(report.purged, vec!["v0", "v1"]);
    assert!(report.failed.is_empty());
    assert_eq!(storage.bucket_names().unwrap(), vec!["v2"]);

    let again = worker.purge_stale_buckets().unwrap();
    assert!(again.purged.is_empty());
    assert_eq!(storage.bucket_names().unwrap(), vec!["v2"]);
  }

  #[tokio::test]
  async fn test_route_dispatches_by_origin() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(site().with("https://tiles.example.com/5/10/12.png", "png"));
    let manifest = AssetManifest::required(["/index.html", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::clone(&fetcher));
    worker.install().await.unwrap();
    let calls = fetcher.calls();

    let own = worker
      .route(&Request::get(Url::parse("https://maps.example.org/index.html").unwrap()))
      .await;
    assert_eq!(own.source, ResponseSource::Cache);
    assert_eq!(fetcher.calls(), calls);

    let tile = worker
      .route(&Request::get(Url::parse("https://tiles.example.com/5/10/12.png").unwrap()))
      .await;
    assert_eq!(tile.source, ResponseSource::Network);
    assert_eq!(fetcher.calls(), calls + 1);
    assert_eq!(storage.entries("v1").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_offline_tile_without_copy_gets_fallback_document() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(site());
    let manifest = AssetManifest::required(["/index.html", "/app.js", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v1", manifest), Arc::clone(&storage), Arc::clone(&fetcher));
    worker.install().await.unwrap();
    fetcher.set_offline(true);

    let result = worker
      .route(&Request::get(Url::parse("https://tiles.example.com/5/10/12.png").unwrap()))
      .await;
    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.body, b"offline");
  }

  #[test]
  fn test_record_round_trips_through_from_record() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    let manifest = AssetManifest::required(["/index.html", "/offline.html"]);
    let worker = CacheWorker::new(&spec("v7", manifest), Arc::clone(&storage), Arc::clone(&fetcher));

    let record = worker.record(WorkerState::Active);
    assert_eq!(record.fallback, "https://maps.example.org/offline.html");

    let restored = CacheWorker::from_record(&record, storage, fetcher, None).unwrap();
    assert_eq!(restored.bucket(), "v7");
    assert_eq!(restored.manifest_digest(), worker.manifest_digest());
  }
}
