//! Core traits and types for bucket storage.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;

use crate::request::Request;
use crate::worker::{WorkerRecord, WorkerSlot};

/// A response as held in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Answer of last resort when even the offline document is missing.
  pub fn unavailable() -> Self {
    Self::new(503, "Service Unavailable: offline and no cached copy")
      .with_header("content-type", "text/plain; charset=utf-8")
  }
}

/// A bucket entry read back from storage.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub url: String,
  pub response: StoredResponse,
  /// Manifest entries are pinned; write-through entries are not
  pub pinned: bool,
  pub cached_at: DateTime<Utc>,
}

/// Per-bucket listing used by status reports.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
  pub name: String,
  pub entries: usize,
  pub pinned: usize,
  pub bytes: u64,
}

/// Per-entry listing used by status reports.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
  pub url: String,
  pub status: u16,
  pub pinned: bool,
  pub bytes: u64,
  pub cached_at: DateTime<Utc>,
}

/// Result of routing a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct RouteResult {
  pub response: StoredResponse,
  pub source: ResponseSource,
  /// When the response was cached (if served from a bucket)
  pub cached_at: Option<DateTime<Utc>>,
}

impl RouteResult {
  /// Fresh response from the network.
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// Cache hit on the cache-first path.
  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
      cached_at: Some(entry.cached_at),
    }
  }

  /// Cached copy served because the network failed.
  pub fn offline(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Offline,
      cached_at: Some(entry.cached_at),
    }
  }

  /// The offline fallback document (or the built-in 503 if it is missing).
  pub fn fallback(response: StoredResponse, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      cached_at,
    }
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Bucket hit, no network involved
  Cache,
  /// Network unavailable, serving a previously cached copy
  Offline,
  /// Nothing usable, serving the offline fallback document
  Fallback,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
    }
  }
}

/// Trait for bucket storage backends.
///
/// Writes are keyed overwrites; implementations serialize them internally.
pub trait BucketStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, bucket: &str) -> Result<()>;

  /// Names of every bucket, current or stale.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  fn bucket_summaries(&self) -> Result<Vec<BucketSummary>>;

  fn entries(&self, bucket: &str) -> Result<Vec<EntrySummary>>;

  /// Look up the stored response for a request.
  fn get(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Store a single response in an existing bucket, replacing any previous
  /// entry for the request. Returns false, writing nothing, when the bucket
  /// does not exist (for instance after it was purged).
  fn put(
    &self,
    bucket: &str,
    request: &Request,
    response: &StoredResponse,
    pinned: bool,
  ) -> Result<bool>;

  /// Store pinned responses atomically, creating the bucket if needed:
  /// either all of them land or none do. Pinned entries not in `entries` are
  /// removed, so the bucket holds exactly this manifest set.
  fn put_all(&self, bucket: &str, entries: &[(Request, StoredResponse)]) -> Result<()>;

  /// Drop the oldest unpinned entries so at most `keep` remain. Returns how
  /// many were removed.
  fn evict_runtime(&self, bucket: &str, keep: usize) -> Result<usize>;

  fn load_worker(&self, slot: WorkerSlot) -> Result<Option<WorkerRecord>>;

  fn save_worker(&self, slot: WorkerSlot, record: &WorkerRecord) -> Result<()>;

  fn clear_worker(&self, slot: WorkerSlot) -> Result<()>;
}
