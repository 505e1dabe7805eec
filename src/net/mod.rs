//! Network access behind a small trait so routing can be exercised offline.

mod client;
#[cfg(test)]
pub mod fake;

use color_eyre::Result;
use futures::future::BoxFuture;

use crate::cache::StoredResponse;
use crate::request::Request;

pub use client::HttpFetcher;

/// Something that can perform a network fetch.
///
/// An `Err` means the network was unreachable (connection refused, DNS,
/// timeout). HTTP error statuses are still `Ok` responses.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<StoredResponse>>;
}
