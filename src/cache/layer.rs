//! Strategy execution over the bounded store.
//!
//! Each strategy takes the network as a fetch closure so callers (and tests)
//! decide what "the network" is. All three are total: network and storage
//! failures are absorbed here, and the worst case is the synthetic offline
//! response.

use std::future::Future;
use tracing::{debug, warn};

use super::store::CacheStore;
use super::traits::{CacheBackend, CacheEntry};
use crate::fetch::ResponseData;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Fresh from the network
  Network,
  /// From cache, within its freshness window
  Cache,
  /// From cache, past its freshness window (stale-while-revalidate only)
  CacheStale,
  /// Synthetic offline response; neither network nor cache had it
  Offline,
}

/// Outcome of executing a strategy for one request.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: ResponseData,
  pub source: FetchSource,
}

impl FetchOutcome {
  fn offline() -> Self {
    Self {
      response: ResponseData::offline(),
      source: FetchSource::Offline,
    }
  }
}

/// Executes the retrieval strategies against a store and a fetch closure.
pub struct CacheLayer<B: CacheBackend> {
  store: CacheStore<B>,
}

impl<B: CacheBackend + 'static> CacheLayer<B> {
  pub fn new(store: CacheStore<B>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &CacheStore<B> {
    &self.store
  }

  /// cache-first: serve an unexpired entry without touching the network;
  /// otherwise fetch, store a copy, and serve the network response.
  pub async fn cache_first<F, Fut>(&self, partition: &str, key: &str, fetch: F) -> FetchOutcome
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<ResponseData>>,
  {
    if let Some(entry) = self.lookup(partition, key) {
      return FetchOutcome {
        response: entry.response,
        source: FetchSource::Cache,
      };
    }

    match fetch().await {
      Ok(response) => {
        self.store_copy(partition, key, &response);
        FetchOutcome {
          response,
          source: FetchSource::Network,
        }
      }
      Err(e) => {
        debug!(partition, key, error = %e, "Network failed with no cached entry");
        FetchOutcome::offline()
      }
    }
  }

  /// network-first: prefer the network, fall back to the cache, and only
  /// then to the synthetic offline response.
  pub async fn network_first<F, Fut>(&self, partition: &str, key: &str, fetch: F) -> FetchOutcome
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<ResponseData>>,
  {
    match fetch().await {
      Ok(response) => {
        self.store_copy(partition, key, &response);
        FetchOutcome {
          response,
          source: FetchSource::Network,
        }
      }
      Err(e) => {
        debug!(partition, key, error = %e, "Network failed; falling back to cache");
        match self.lookup(partition, key) {
          Some(entry) => FetchOutcome {
            response: entry.response,
            source: FetchSource::Cache,
          },
          None => FetchOutcome::offline(),
        }
      }
    }
  }

  /// stale-while-revalidate: serve whatever is cached immediately (expired or
  /// not) and refresh the entry in the background; with nothing cached this
  /// degrades to network-first for the one request.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    partition: &str,
    key: &str,
    fetch: F,
  ) -> FetchOutcome
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<ResponseData>> + Send + 'static,
  {
    let cached = match self.store.get_any(partition, key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(partition, key, error = %e, "Cache read failed; treating as miss");
        None
      }
    };

    match cached {
      Some((entry, expired)) => {
        self.revalidate(partition, key, fetch);
        FetchOutcome {
          response: entry.response,
          source: if expired {
            FetchSource::CacheStale
          } else {
            FetchSource::Cache
          },
        }
      }
      None => self.network_first(partition, key, fetch).await,
    }
  }

  /// Background refresh: the network result silently replaces the entry.
  fn revalidate<F, Fut>(&self, partition: &str, key: &str, fetch: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<ResponseData>> + Send + 'static,
  {
    let store = self.store.clone();
    let partition = partition.to_string();
    let key = key.to_string();

    tokio::spawn(async move {
      match fetch().await {
        Ok(response) => {
          if let Err(e) = store.put(&partition, &key, response) {
            warn!(partition, key, error = %e, "Failed to store revalidated response");
          }
        }
        Err(e) => debug!(partition, key, error = %e, "Background revalidation failed"),
      }
    });
  }

  fn lookup(&self, partition: &str, key: &str) -> Option<CacheEntry> {
    match self.store.get(partition, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition, key, error = %e, "Cache read failed; treating as miss");
        None
      }
    }
  }

  /// Best-effort write: a failed cache write never affects the response
  /// already in flight to the caller.
  fn store_copy(&self, partition: &str, key: &str, response: &ResponseData) {
    if let Err(e) = self.store.put(partition, key, response.clone()) {
      warn!(partition, key, error = %e, "Cache write failed; response still served");
    }
  }
}

impl<B: CacheBackend> Clone for CacheLayer<B> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::MemoryBackend;
  use crate::config::{CacheConfig, PartitionConfig};
  use chrono::{Duration as ChronoDuration, Utc};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn response(body: &str) -> ResponseData {
    ResponseData {
      status: 200,
      headers: vec![],
      body: body.as_bytes().to_vec(),
    }
  }

  fn layer_with(max_age_secs: i64) -> CacheLayer<MemoryBackend> {
    let config = CacheConfig {
      version: 1,
      partitions: vec![PartitionConfig {
        name: "dynamic".to_string(),
        max_entries: 10,
        max_age_secs,
      }],
    };
    CacheLayer::new(CacheStore::new(MemoryBackend::new(), &config))
  }

  fn counting_fetch(
    counter: Arc<AtomicU32>,
    body: &str,
  ) -> impl FnOnce() -> std::future::Ready<color_eyre::Result<ResponseData>> {
    let body = body.to_string();
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      std::future::ready(Ok(response(&body)))
    }
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer_with(3600);
    layer.store().put("dynamic", "k", response("cached")).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let outcome = layer
      .cache_first("dynamic", "k", counting_fetch(calls.clone(), "net"))
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.source, FetchSource::Cache);
    assert_eq!(outcome.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let layer = layer_with(3600);
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = layer
      .cache_first("dynamic", "k", counting_fetch(calls.clone(), "net"))
      .await;
    assert_eq!(outcome.source, FetchSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Second request is a pure cache hit.
    let outcome = layer
      .cache_first("dynamic", "k", counting_fetch(calls.clone(), "net2"))
      .await;
    assert_eq!(outcome.source, FetchSource::Cache);
    assert_eq!(outcome.response.body, b"net");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_offline_without_entry() {
    let layer = layer_with(3600);

    let outcome = layer
      .cache_first("dynamic", "k", || {
        std::future::ready(Err(eyre!("connection refused")))
      })
      .await;

    assert_eq!(outcome.source, FetchSource::Offline);
    assert_eq!(outcome.response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let layer = layer_with(3600);
    layer.store().put("dynamic", "k", response("cached")).unwrap();

    let outcome = layer
      .network_first("dynamic", "k", || {
        std::future::ready(Err(eyre!("connection refused")))
      })
      .await;

    assert_eq!(outcome.source, FetchSource::Cache);
    assert_eq!(outcome.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_offline_when_both_fail() {
    let layer = layer_with(3600);

    let outcome = layer
      .network_first("dynamic", "k", || {
        std::future::ready(Err(eyre!("connection refused")))
      })
      .await;

    assert_eq!(outcome.source, FetchSource::Offline);
    assert_eq!(outcome.response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache() {
    let layer = layer_with(3600);
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = layer
      .network_first("dynamic", "k", counting_fetch(calls.clone(), "fresh"))
      .await;
    assert_eq!(outcome.source, FetchSource::Network);

    let entry = layer.store().get("dynamic", "k").unwrap().unwrap();
    assert_eq!(entry.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_swr_serves_cached_before_network_resolves() {
    let layer = layer_with(3600);
    layer.store().put("dynamic", "k", response("old")).unwrap();

    let outcome = layer
      .stale_while_revalidate("dynamic", "k", || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(response("new"))
      })
      .await;

    // Served from cache without waiting on the 50ms fetch.
    assert_eq!(outcome.source, FetchSource::Cache);
    assert_eq!(outcome.response.body, b"old");

    // The cache self-heals once the background fetch resolves.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = layer.store().get("dynamic", "k").unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
  }

  #[tokio::test]
  async fn test_swr_serves_expired_entries() {
    // Seed an already-expired entry directly through the backend.
    let backend = MemoryBackend::new();
    let expired = CacheEntry {
      response: response("stale"),
      stored_at: Utc::now() - ChronoDuration::hours(2),
    };
    backend.write("dynamic-v1", "k", &expired).unwrap();

    let config = CacheConfig {
      version: 1,
      partitions: vec![PartitionConfig {
        name: "dynamic".to_string(),
        max_entries: 10,
        max_age_secs: 3600,
      }],
    };
    let layer = CacheLayer::new(CacheStore::new(backend, &config));

    let outcome = layer
      .stale_while_revalidate("dynamic", "k", || async { Ok(response("new")) })
      .await;

    assert_eq!(outcome.source, FetchSource::CacheStale);
    assert_eq!(outcome.response.body, b"stale");
  }

  #[tokio::test]
  async fn test_swr_degrades_to_network_first_on_miss() {
    let layer = layer_with(3600);
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = layer
      .stale_while_revalidate("dynamic", "k", counting_fetch(calls.clone(), "net"))
      .await;

    assert_eq!(outcome.source, FetchSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  /// Backend whose writes always fail; reads see an empty store.
  struct BrokenBackend;

  impl CacheBackend for BrokenBackend {
    fn read(&self, _: &str, _: &str) -> color_eyre::Result<Option<CacheEntry>> {
      Ok(None)
    }
    fn write(&self, _: &str, _: &str, _: &CacheEntry) -> color_eyre::Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn remove(&self, _: &str, _: &str) -> color_eyre::Result<()> {
      Ok(())
    }
    fn keys(&self, _: &str) -> color_eyre::Result<Vec<String>> {
      Ok(vec![])
    }
    fn count(&self, _: &str) -> color_eyre::Result<usize> {
      Ok(0)
    }
    fn partitions(&self) -> color_eyre::Result<Vec<String>> {
      Ok(vec![])
    }
    fn drop_partition(&self, _: &str) -> color_eyre::Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_storage_failure_does_not_affect_response() {
    let config = CacheConfig {
      version: 1,
      partitions: vec![],
    };
    let layer = CacheLayer::new(CacheStore::new(BrokenBackend, &config));

    let outcome = layer
      .cache_first("dynamic", "k", || std::future::ready(Ok(response("net"))))
      .await;

    // The write failed, but the network response still went to the caller.
    assert_eq!(outcome.source, FetchSource::Network);
    assert_eq!(outcome.response.body, b"net");
  }
}
