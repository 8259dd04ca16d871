//! Install/activate lifecycle and cache generation cleanup.
//!
//! A generation is the versioned set of partitions for one deployed
//! configuration. Installing pre-warms the new generation; activating deletes
//! every partition that is not part of it, so exactly one generation per
//! logical name survives.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use tracing::{debug, info};
use url::Url;

use crate::cache::{fingerprint, CacheBackend, CacheStore};
use crate::fetch::ResponseData;

/// Partition that install-time prefetches land in.
const PRECACHE_PARTITION: &str = "static";

/// Lifecycle states, in order. `Failed` is terminal for one install attempt;
/// the previous generation keeps serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
  Installing,
  Installed,
  Activating,
  Active,
  Failed,
}

/// Drives the install/activate lifecycle against the cache store.
pub struct LifecycleManager<B: CacheBackend> {
  store: CacheStore<B>,
  state: AgentState,
}

impl<B: CacheBackend> LifecycleManager<B> {
  pub fn new(store: CacheStore<B>) -> Self {
    Self {
      store,
      state: AgentState::Installing,
    }
  }

  pub fn state(&self) -> AgentState {
    self.state
  }

  /// Prefetch the critical-asset manifest into the static partition.
  ///
  /// Every manifest URL must fetch successfully with a 2xx status; a single
  /// failure fails the whole install and the previous generation stays in
  /// service. This step gates activation and is never skipped.
  pub async fn install<F, Fut>(&mut self, manifest: &[Url], fetch: F) -> Result<()>
  where
    F: Fn(Url) -> Fut,
    Fut: Future<Output = Result<ResponseData>>,
  {
    self.state = AgentState::Installing;
    info!(assets = manifest.len(), "Installing: prefetching critical assets");

    for url in manifest {
      let response = match fetch(url.clone()).await {
        Ok(response) => response,
        Err(e) => {
          self.state = AgentState::Failed;
          return Err(eyre!("Install failed: could not prefetch {}: {}", url, e));
        }
      };

      if !response.is_success() {
        self.state = AgentState::Failed;
        return Err(eyre!(
          "Install failed: prefetch of {} returned {}",
          url,
          response.status
        ));
      }

      let key = fingerprint(&Method::GET, url);
      if let Err(e) = self.store.put(PRECACHE_PARTITION, &key, response) {
        // Unlike request-path writes, install is all-or-nothing.
        self.state = AgentState::Failed;
        return Err(eyre!("Install failed: could not store {}: {}", url, e));
      }
      debug!(url = %url, "Precached");
    }

    self.state = AgentState::Installed;
    Ok(())
  }

  /// True when this generation is installed but an older generation's
  /// partitions still exist, i.e. an update is waiting to be adopted.
  pub fn update_waiting(&self) -> Result<bool> {
    Ok(self.state == AgentState::Installed && !self.store.stale_partitions()?.is_empty())
  }

  /// Delete every partition that is not part of the current generation.
  ///
  /// Returns the dropped partition names. After this, already-open clients
  /// are expected to be claimed by the caller so they route through the new
  /// generation without a reload.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    self.state = AgentState::Activating;

    let dropped = self.store.drop_stale_generations()?;
    for name in &dropped {
      info!(partition = %name, "Removed stale cache generation");
    }

    self.state = AgentState::Active;
    Ok(dropped)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, MemoryBackend};
  use crate::config::{CacheConfig, PartitionConfig};
  use color_eyre::eyre::eyre;

  fn response(status: u16, body: &str) -> ResponseData {
    ResponseData {
      status,
      headers: vec![],
      body: body.as_bytes().to_vec(),
    }
  }

  fn store_with_version(backend: MemoryBackend, version: u32) -> CacheStore<MemoryBackend> {
    CacheStore::new(
      backend,
      &CacheConfig {
        version,
        partitions: vec![PartitionConfig {
          name: "static".to_string(),
          max_entries: 20,
          max_age_secs: 86400,
        }],
      },
    )
  }

  fn manifest(paths: &[&str]) -> Vec<Url> {
    paths
      .iter()
      .map(|p| Url::parse("https://app.example.org").unwrap().join(p).unwrap())
      .collect()
  }

  #[tokio::test]
  async fn test_install_prefetches_manifest() {
    let store = store_with_version(MemoryBackend::new(), 1);
    let mut lifecycle = LifecycleManager::new(store.clone());

    let urls = manifest(&["/", "/styles/main.css", "/scripts/app.js"]);
    lifecycle
      .install(&urls, |url| {
        std::future::ready(Ok(response(200, url.path())))
      })
      .await
      .unwrap();

    assert_eq!(lifecycle.state(), AgentState::Installed);
    for url in &urls {
      let key = fingerprint(&Method::GET, url);
      let entry = store.get("static", &key).unwrap().unwrap();
      assert_eq!(entry.response.body, url.path().as_bytes());
    }
  }

  #[tokio::test]
  async fn test_failed_prefetch_fails_whole_install() {
    let store = store_with_version(MemoryBackend::new(), 1);
    let mut lifecycle = LifecycleManager::new(store.clone());

    let urls = manifest(&["/", "/missing.css"]);
    let result = lifecycle
      .install(&urls, |url| {
        std::future::ready(if url.path() == "/missing.css" {
          Err(eyre!("connection refused"))
        } else {
          Ok(response(200, "ok"))
        })
      })
      .await;

    assert!(result.is_err());
    assert_eq!(lifecycle.state(), AgentState::Failed);
  }

  #[tokio::test]
  async fn test_non_success_prefetch_fails_install() {
    let store = store_with_version(MemoryBackend::new(), 1);
    let mut lifecycle = LifecycleManager::new(store);

    let result = lifecycle
      .install(&manifest(&["/gone.js"]), |_| {
        std::future::ready(Ok(response(404, "not found")))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(lifecycle.state(), AgentState::Failed);
  }

  #[tokio::test]
  async fn test_activation_deletes_previous_generation() {
    let backend = MemoryBackend::new();
    backend
      .write(
        "static-v1",
        "k",
        &CacheEntry::new(response(200, "old generation")),
      )
      .unwrap();

    let store = store_with_version(backend, 2);
    let mut lifecycle = LifecycleManager::new(store.clone());

    lifecycle
      .install(&manifest(&["/"]), |_| {
        std::future::ready(Ok(response(200, "new generation")))
      })
      .await
      .unwrap();
    assert!(lifecycle.update_waiting().unwrap());

    let dropped = lifecycle.activate().unwrap();
    assert_eq!(dropped, vec!["static-v1"]);
    assert_eq!(lifecycle.state(), AgentState::Active);
    assert!(store.stale_partitions().unwrap().is_empty());

    // The stats no longer know anything about v1.
    let stats = store.stats().unwrap();
    assert_eq!(stats.partitions.len(), 1);
    assert_eq!(stats.partitions[0].name, "static-v2");
    assert_eq!(stats.partitions[0].entries, 1);
  }

  #[tokio::test]
  async fn test_no_update_waiting_without_stale_generations() {
    let store = store_with_version(MemoryBackend::new(), 1);
    let mut lifecycle = LifecycleManager::new(store);

    lifecycle
      .install(&manifest(&["/"]), |_| {
        std::future::ready(Ok(response(200, "ok")))
      })
      .await
      .unwrap();

    assert!(!lifecycle.update_waiting().unwrap());
  }
}
