use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;

use super::Fetcher;
use crate::cache::StoredResponse;
use crate::config::NetworkConfig;
use crate::request::Request;

/// Headers describing the wire encoding, which no longer match once the body
/// has been decoded and buffered.
const DROPPED_HEADERS: &[&str] = &[
  "connection",
  "content-encoding",
  "content-length",
  "keep-alive",
  "transfer-encoding",
];

/// HTTP fetcher wrapper
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(config.user_agent.as_str())
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: &Request) -> Result<StoredResponse> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !DROPPED_HEADERS.contains(&name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(StoredResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<StoredResponse>> {
    self.send(request).boxed()
  }
}
