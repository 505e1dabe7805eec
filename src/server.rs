//! Local HTTP proxy in front of the registration.
//!
//! Origin-form requests (`GET /index.html`) are first-party paths under the
//! configured origin. Absolute-form requests (`GET http://tiles.../1/2/3.png`),
//! as sent by clients using this server as a forward proxy, are routed by
//! their own origin.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{BucketStorage, ResponseSource, RouteResult, SqliteStorage};
use crate::net::{Fetcher, HttpFetcher};
use crate::request::Request;
use crate::worker::{Registration, StatusReport};

pub type CacheRouter = Registration<SqliteStorage, HttpFetcher>;

const SOURCE_HEADER: &str = "x-cartes-source";

struct ServerState<S: BucketStorage, F: Fetcher> {
  registration: Arc<Registration<S, F>>,
  origin: Arc<Url>,
}

impl<S: BucketStorage, F: Fetcher> Clone for ServerState<S, F> {
  fn clone(&self) -> Self {
    Self {
      registration: Arc::clone(&self.registration),
      origin: Arc::clone(&self.origin),
    }
  }
}

pub fn router<S, F>(registration: Arc<Registration<S, F>>, origin: Url) -> Router
where
  S: BucketStorage + 'static,
  F: Fetcher + 'static,
{
  let state = ServerState {
    registration,
    origin: Arc::new(origin),
  };

  Router::new()
    .route("/__cartes/status", get(status::<S, F>))
    .fallback(proxy::<S, F>)
    .with_state(state)
}

pub async fn serve(registration: Arc<CacheRouter>, origin: Url, listen: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(listen, origin = %origin, "serving");

  axum::serve(listener, router(registration, origin))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn shutdown_signal() {
  if tokio::signal::ctrl_c().await.is_ok() {
    info!("shutting down");
  }
}

async fn status<S, F>(
  State(state): State<ServerState<S, F>>,
) -> std::result::Result<Json<StatusReport>, (StatusCode, String)>
where
  S: BucketStorage + 'static,
  F: Fetcher + 'static,
{
  state
    .registration
    .status()
    .map(Json)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn proxy<S, F>(State(state): State<ServerState<S, F>>, method: Method, uri: Uri) -> Response
where
  S: BucketStorage + 'static,
  F: Fetcher + 'static,
{
  if method != Method::GET && method != Method::HEAD {
    return (StatusCode::METHOD_NOT_ALLOWED, "Only GET and HEAD are proxied").into_response();
  }

  let url = match resolve_target(&state.origin, &uri) {
    Ok(url) => url,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  match state.registration.route(&Request::new(method, url)).await {
    Ok(result) => into_response(result),
    Err(e) => {
      warn!(uri = %uri, error = %e, "request failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

/// Absolute URL a proxied request refers to.
fn resolve_target(origin: &Url, uri: &Uri) -> Result<Url> {
  if uri.scheme().is_some() {
    return Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request URI '{}': {}", uri, e));
  }

  // Relative to the origin's directory; leading slashes would escape it
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  origin
    .join(path.trim_start_matches('/'))
    .map_err(|e| eyre!("Invalid request path '{}': {}", path, e))
}

fn into_response(result: RouteResult) -> Response {
  let status = StatusCode::from_u16(result.response.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut response = Response::new(Body::from(result.response.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &result.response.headers {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(result.source.as_str()));
  if result.source != ResponseSource::Network {
    if let Some(cached_at) = result.cached_at {
      let age = (Utc::now() - cached_at).num_seconds().max(0);
      headers.insert(header::AGE, HeaderValue::from(age));
    }
  }

  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::StoredResponse;
  use crate::manifest::AssetManifest;
  use crate::net::fake::FakeFetcher;
  use crate::worker::WorkerSpec;

  type TestRouter = Registration<SqliteStorage, FakeFetcher>;

  fn origin() -> Url {
    Url::parse("https://maps.example.org/salins/").unwrap()
  }

  fn page(path: &str) -> String {
    origin().join(path).unwrap().to_string()
  }

  fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
  }

  fn registration() -> (Arc<FakeFetcher>, Arc<TestRouter>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(
      FakeFetcher::new()
        .with(&page("index.html"), "<html>")
        .with(&page("offline.html"), "offline"),
    );
    let registration = Arc::new(Registration::new(storage, Arc::clone(&fetcher)));
    (fetcher, registration)
  }

  async fn install(registration: &TestRouter) {
    let spec = WorkerSpec {
      bucket: "v1".to_string(),
      origin: origin(),
      manifest: AssetManifest::required(["./index.html", "./offline.html"]),
      fallback: origin().join("offline.html").unwrap(),
      max_runtime_entries: None,
      skip_waiting: true,
    };
    registration.install(&spec, false).await.unwrap();
  }

  /// Serve the router on an ephemeral local port and return its base URL.
  async fn spawn(registration: Arc<TestRouter>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(registration, origin());
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
  }

  #[tokio::test]
  async fn test_post_is_not_proxied() {
    let (fetcher, registration) = registration();
    let base = spawn(registration).await;

    let response = client()
      .post(format!("{}/index.html", base))
      .body("x=1")
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_hit_carries_source_and_age() {
    let (fetcher, registration) = registration();
    install(&registration).await;
    fetcher.set_offline(true);
    let base = spawn(registration).await;

    let response = client()
      .get(format!("{}/index.html", base))
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()[SOURCE_HEADER], "cache");
    assert!(response.headers().contains_key("age"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"<html>");
  }

  #[tokio::test]
  async fn test_offline_fallback_over_http() {
    let (fetcher, registration) = registration();
    install(&registration).await;
    fetcher.set_offline(true);
    let base = spawn(registration).await;

    let response = client()
      .get(format!("{}/plans.json", base))
      .send()
      .await
      .unwrap();
    assert_eq!(response.headers()[SOURCE_HEADER], "fallback");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"offline");
  }

  #[tokio::test]
  async fn test_unreachable_network_without_worker_is_bad_gateway() {
    let (fetcher, registration) = registration();
    fetcher.set_offline(true);
    let base = spawn(registration).await;

    let response = client()
      .get(format!("{}/index.html", base))
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
  }

  #[tokio::test]
  async fn test_status_endpoint_reports_active_bucket() {
    let (_fetcher, registration) = registration();
    install(&registration).await;
    let base = spawn(registration).await;

    let response = client()
      .get(format!("{}/__cartes/status", base))
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(body["active"]["bucket"], "v1");
    assert_eq!(body["active"]["state"], "active");
    assert!(body["pending"].is_null());
    assert_eq!(body["buckets"][0]["name"], "v1");
    assert_eq!(body["buckets"][0]["entries"], 2);
  }

  #[test]
  fn test_origin_form_resolves_under_origin() {
    let uri: Uri = "/index.html?v=3".parse().unwrap();
    assert_eq!(
      resolve_target(&origin(), &uri).unwrap().as_str(),
      "https://maps.example.org/salins/index.html?v=3"
    );

    let root: Uri = "/".parse().unwrap();
    assert_eq!(
      resolve_target(&origin(), &root).unwrap().as_str(),
      "https://maps.example.org/salins/"
    );
  }

  #[test]
  fn test_scheme_relative_path_stays_on_origin() {
    let uri: Uri = "//evil.example.com/x.js".parse().unwrap();
    let url = resolve_target(&origin(), &uri).unwrap();
    assert_eq!(url.host_str(), Some("maps.example.org"));
  }

  #[test]
  fn test_absolute_form_keeps_its_origin() {
    let uri: Uri = "http://tiles.example.com/5/10/12.png".parse().unwrap();
    assert_eq!(
      resolve_target(&origin(), &uri).unwrap().as_str(),
      "http://tiles.example.com/5/10/12.png"
    );
  }

  #[test]
  fn test_into_response_copies_status_headers_and_source() {
    let result = RouteResult::from_network(
      StoredResponse::new(201, "created")
        .with_header("content-type", "text/plain")
        .with_header("bad header", "ignored"),
    );
    let response = into_response(result);

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()[SOURCE_HEADER], "network");
    assert_eq!(response.headers().len(), 2);
  }
}
