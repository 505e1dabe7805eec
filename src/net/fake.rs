//! Scripted fetcher for tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::Fetcher;
use crate::cache::StoredResponse;
use crate::request::Request;

/// Serves canned responses by URL. Unknown URLs answer 404; URLs marked
/// unreachable (or everything, when offline) fail like a dropped connection.
#[derive(Default)]
pub struct FakeFetcher {
  responses: Mutex<HashMap<String, StoredResponse>>,
  unreachable: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `body` with status 200 at `url`.
  pub fn with(self, url: &str, body: &str) -> Self {
    self.set(url, StoredResponse::new(200, body));
    self
  }

  pub fn set(&self, url: &str, response: StoredResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn fail(&self, url: &str) {
    self.unreachable.lock().unwrap().insert(url.to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Number of fetches attempted so far, failed ones included.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn respond(&self, request: &Request) -> Result<StoredResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let url = request.url.as_str();

    if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(url) {
      return Err(eyre!("Failed to fetch {}: network unreachable", url));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(url)
        .cloned()
        .unwrap_or_else(|| StoredResponse::new(404, "Not Found")),
    )
  }
}

impl Fetcher for FakeFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<StoredResponse>> {
    future::ready(self.respond(request)).boxed()
  }
}
