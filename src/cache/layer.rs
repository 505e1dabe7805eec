//! Retrieval strategies over a single bucket.

use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

use super::traits::{BucketStorage, CachedEntry, RouteResult, StoredResponse};
use crate::net::Fetcher;
use crate::request::Request;

/// Cache layer that combines one bucket with network fetching.
///
/// Every strategy resolves to some response: network failures are answered
/// from the bucket or with the offline fallback document, never as errors.
pub struct CacheLayer<S: BucketStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  bucket: String,
  fallback: Request,
  /// Cap on write-through entries; manifest entries do not count
  max_runtime_entries: Option<usize>,
}

impl<S: BucketStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, bucket: impl Into<String>, fallback: Url) -> Self {
    Self {
      storage,
      fetcher,
      bucket: bucket.into(),
      fallback: Request::get(fallback),
      max_runtime_entries: None,
    }
  }

  pub fn with_runtime_limit(mut self, limit: Option<usize>) -> Self {
    self.max_runtime_entries = limit;
    self
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  pub fn fallback_url(&self) -> &Url {
    &self.fallback.url
  }

  /// Cache-first retrieval for first-party requests.
  ///
  /// 1. Bucket hit - return immediately, no network
  /// 2. Miss - fetch; write successful responses through to the bucket
  /// 3. Network failure - offline fallback document
  pub async fn cache_first(&self, request: &Request) -> RouteResult {
    if let Some(entry) = self.lookup(request) {
      debug!(url = %entry.url, bucket = %self.bucket, pinned = entry.pinned, "cache hit");
      return RouteResult::from_cache(entry);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.write_through(request, &response);
        }
        RouteResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable on cache miss");
        self.fallback()
      }
    }
  }

  /// Network-first retrieval for third-party requests.
  ///
  /// Successful fetches are returned without being cached. On network
  /// failure, a previously cached copy of this exact request is served, else
  /// the offline fallback document.
  pub async fn network_first(&self, request: &Request) -> RouteResult {
    match self.fetcher.fetch(request).await {
      Ok(response) => RouteResult::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable, trying bucket");
        match self.lookup(request) {
          Some(entry) => RouteResult::offline(entry),
          None => self.fallback(),
        }
      }
    }
  }

  /// Requests that are never cached (anything but GET) go straight to the
  /// network, with the fallback document if it is unreachable.
  pub async fn passthrough(&self, request: &Request) -> RouteResult {
    match self.fetcher.fetch(request).await {
      Ok(response) => RouteResult::from_network(response),
      Err(e) => {
        debug!(method = %request.method, url = %request.url, error = %e, "network unavailable");
        self.fallback()
      }
    }
  }

  /// The offline fallback document from this bucket.
  pub fn fallback(&self) -> RouteResult {
    match self.lookup(&self.fallback) {
      Some(entry) => RouteResult::fallback(entry.response, Some(entry.cached_at)),
      None => {
        error!(
          url = %self.fallback.url,
          bucket = %self.bucket,
          "offline fallback document missing from bucket"
        );
        RouteResult::fallback(StoredResponse::unavailable(), None)
      }
    }
  }

  /// Bucket lookup. Storage errors are logged and treated as a miss.
  fn lookup(&self, request: &Request) -> Option<CachedEntry> {
    if !request.is_cacheable() {
      return None;
    }

    match self.storage.get(&self.bucket, request) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Store a first-party response fetched on a miss, then trim runtime
  /// entries to the configured cap. Failures only cost a future cache hit.
  fn write_through(&self, request: &Request, response: &StoredResponse) {
    if !request.is_cacheable() {
      return;
    }

    match self.storage.put(&self.bucket, request, response, false) {
      Ok(true) => {}
      Ok(false) => {
        warn!(url = %request.url, bucket = %self.bucket, "bucket no longer exists, not caching");
        return;
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "write-through failed");
        return;
      }
    }

    if let Some(limit) = self.max_runtime_entries {
      match self.storage.evict_runtime(&self.bucket, limit) {
        Ok(0) => {}
        Ok(evicted) => debug!(bucket = %self.bucket, evicted, "evicted runtime entries"),
        Err(e) => warn!(bucket = %self.bucket, error = %e, "runtime eviction failed"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::net::fake::FakeFetcher;
  use reqwest::Method;

  const ORIGIN: &str = "https://maps.example.org/";
  const TILE: &str = "https://tiles.example.com/5/10/12.png";

  fn url(s: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(s).unwrap()
  }

  fn setup(fetcher: FakeFetcher) -> (Arc<SqliteStorage>, Arc<FakeFetcher>, CacheLayer<SqliteStorage, FakeFetcher>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(fetcher);
    storage
      .put_all("v1", &[(Request::get(url("/offline.html")), StoredResponse::new(200, "offline"))])
      .unwrap();
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      "v1",
      url("/offline.html"),
    );
    (storage, fetcher, layer)
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let (storage, fetcher, layer) = setup(FakeFetcher::new().with(url("/app.js").as_str(), "new"));
    storage
      .put("v1", &Request::get(url("/app.js")), &StoredResponse::new(200, "old"), true)
      .unwrap();

    let result = layer.cache_first(&Request::get(url("/app.js"))).await;
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.body, b"old");
    assert!(result.cached_at.is_some());
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_writes_through() {
    let (storage, fetcher, layer) = setup(FakeFetcher::new().with(url("/styles.css").as_str(), "body{}"));
    let request = Request::get(url("/styles.css"));

    let result = layer.cache_first(&request).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"body{}");

    let entry = storage.get("v1", &request).unwrap().unwrap();
    assert_eq!(entry.response.body, b"body{}");
    assert!(!entry.pinned);

    // Second request is a hit
    let again = layer.cache_first(&request).await;
    assert_eq!(again.source, ResponseSource::Cache);
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_write_through_does_not_revive_purged_bucket() {
    let (storage, _fetcher, layer) = setup(FakeFetcher::new().with(url("/new.js").as_str(), "late"));
    storage.delete_bucket("v1").unwrap();

    let result = layer.cache_first(&Request::get(url("/new.js"))).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"late");
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_error_statuses() {
    let (storage, _fetcher, layer) = setup(FakeFetcher::new());
    let request = Request::get(url("/missing.png"));

    let result = layer.cache_first(&request).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.status, 404);
    assert!(storage.get("v1", &request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_serves_fallback() {
    let (_storage, fetcher, layer) = setup(FakeFetcher::new());
    fetcher.set_offline(true);

    let result = layer.cache_first(&Request::get(url("/plans.json"))).await;
    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.body, b"offline");
  }

  #[tokio::test]
  async fn test_network_first_success_is_not_cached() {
    let (storage, _fetcher, layer) = setup(FakeFetcher::new().with(TILE, "png"));
    let before = storage.entries("v1").unwrap().len();
    let request = Request::get(Url::parse(TILE).unwrap());

    let result = layer.network_first(&request).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"png");
    assert_eq!(storage.entries("v1").unwrap().len(), before);
  }

  #[tokio::test]
  async fn test_network_first_failure_serves_cached_copy() {
    let (storage, fetcher, layer) = setup(FakeFetcher::new());
    let request = Request::get(Url::parse(TILE).unwrap());
    storage
      .put("v1", &request, &StoredResponse::new(200, "stale png"), false)
      .unwrap();
    fetcher.fail(TILE);

    let result = layer.network_first(&request).await;
    assert_eq!(result.source, ResponseSource::Offline);
    assert_eq!(result.response.body, b"stale png");
  }

  #[tokio::test]
  async fn test_network_first_failure_without_copy_serves_fallback() {
    let (_storage, fetcher, layer) = setup(FakeFetcher::new());
    fetcher.set_offline(true);

    let result = layer
      .network_first(&Request::get(Url::parse(TILE).unwrap()))
      .await;
    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.body, b"offline");
  }

  #[tokio::test]
  async fn test_missing_fallback_answers_unavailable() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.set_offline(true);
    let layer = CacheLayer::new(storage, Arc::clone(&fetcher), "v1", url("/offline.html"));

    let result = layer.cache_first(&Request::get(url("/index.html"))).await;
    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.status, 503);
  }

  #[tokio::test]
  async fn test_runtime_limit_evicts_oldest_write_through() {
    let fetcher = FakeFetcher::new()
      .with(url("/a.html").as_str(), "a")
      .with(url("/b.html").as_str(), "b")
      .with(url("/c.html").as_str(), "c");
    let (storage, _fetcher, layer) = setup(fetcher);
    let layer = layer.with_runtime_limit(Some(2));

    for path in ["/a.html", "/b.html", "/c.html"] {
      layer.cache_first(&Request::get(url(path))).await;
    }

    assert!(storage.get("v1", &Request::get(url("/a.html"))).unwrap().is_none());
    assert!(storage.get("v1", &Request::get(url("/c.html"))).unwrap().is_some());
    // Pinned fallback survives eviction
    assert!(storage.get("v1", &Request::get(url("/offline.html"))).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_passthrough_never_touches_bucket() {
    let (storage, fetcher, layer) = setup(FakeFetcher::new());
    let request = Request::new(Method::POST, url("/offline.html"));

    let result = layer.passthrough(&request).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.status, 404);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(storage.entries("v1").unwrap().len(), 1);
  }
}
