//! HTTP client wrapper and response snapshots.
//!
//! The agent never hands live network responses around; it snapshots status,
//! headers, and body into a `ResponseData` that can be stored, replayed, and
//! compared in tests.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Body of the synthetic response served when both network and cache come up
/// empty.
const OFFLINE_BODY: &[u8] = b"Offline: the requested resource is not available";

/// A snapshot of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
  pub status: u16,
  /// Header name/value pairs in response order.
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseData {
  /// Synthetic offline error response (HTTP 503, plain text).
  pub fn offline() -> Self {
    Self {
      status: 503,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: OFFLINE_BODY.to_vec(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// HTTP client for the agent's network side.
///
/// Wraps a shared `reqwest::Client`; cloning is cheap.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  origin: Url,
}

impl HttpClient {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Fetch a URL and snapshot the full response.
  ///
  /// Returns whatever status the server sent; only transport failures are
  /// errors. The cache stores what the network said.
  pub async fn fetch(&self, method: Method, url: &Url) -> Result<ResponseData> {
    let response = self
      .client
      .request(method, url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
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
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?
      .to_vec();

    Ok(ResponseData {
      status,
      headers,
      body,
    })
  }

  /// Post a JSON payload to an endpoint.
  ///
  /// Non-2xx statuses are errors here: the replay queue needs the failure so
  /// it keeps the task around for the next drain.
  pub async fn post_json(&self, endpoint: &str, payload: &serde_json::Value) -> Result<()> {
    let url = self.resolve(endpoint)?;
    let body = serde_json::to_vec(payload)?;

    let response = self
      .client
      .post(url.clone())
      .header("content-type", "application/json")
      .body(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to post to {}: {}", url, e))?;

    if !response.status().is_success() {
      return Err(eyre!("Endpoint {} replied {}", url, response.status()));
    }

    Ok(())
  }

  /// Cheap reachability check against the origin.
  pub async fn probe(&self) -> bool {
    self.client.head(self.origin.clone()).send().await.is_ok()
  }

  /// Resolve an endpoint that may be a path or a full URL.
  pub fn resolve(&self, endpoint: &str) -> Result<Url> {
    self
      .origin
      .join(endpoint)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", endpoint, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_response_shape() {
    let response = ResponseData::offline();
    assert_eq!(response.status, 503);
    assert!(!response.is_success());
    assert_eq!(
      response.headers,
      vec![("content-type".to_string(), "text/plain".to_string())]
    );
    assert!(!response.body.is_empty());
  }

  #[test]
  fn test_resolve_joins_paths_and_keeps_full_urls() {
    let client = HttpClient::new(Url::parse("https://app.example.org").unwrap()).unwrap();

    let joined = client.resolve("/api/telemetry").unwrap();
    assert_eq!(joined.as_str(), "https://app.example.org/api/telemetry");

    let absolute = client.resolve("https://other.example.org/hook").unwrap();
    assert_eq!(absolute.as_str(), "https://other.example.org/hook");
  }

  #[test]
  fn test_is_success_bounds() {
    let mut response = ResponseData::offline();
    response.status = 200;
    assert!(response.is_success());
    response.status = 299;
    assert!(response.is_success());
    response.status = 304;
    assert!(!response.is_success());
  }
}
