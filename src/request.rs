//! Request identity and origin classification.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Only GET responses are ever looked up in or written to a bucket.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// URL used for matching, without its fragment.
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length bucket key for this request.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.cache_url().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Which retrieval strategy a request falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
  /// Same origin as the application shell
  First,
  /// Tile servers and other external providers
  Third,
}

/// Classify `url` against the application origin (scheme, host and port).
pub fn classify(url: &Url, origin: &Url) -> Party {
  let own = origin.origin();
  if own.is_tuple() && url.origin() == own {
    Party::First
  } else {
    Party::Third
  }
}
