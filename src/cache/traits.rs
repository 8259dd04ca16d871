//! Entry types, the storage backend trait, and request fingerprinting.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::fetch::ResponseData;

/// One cached request/response pair.
///
/// `stored_at` is set when the entry is written and never mutated afterwards;
/// expiry is always computed against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub response: ResponseData,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(response: ResponseData) -> Self {
    Self {
      response,
      stored_at: Utc::now(),
    }
  }

  /// Age in whole seconds. Clock skew yields zero, not a negative age.
  pub fn age_secs(&self) -> i64 {
    (Utc::now() - self.stored_at).num_seconds().max(0)
  }
}

/// Storage backend for cache partitions.
///
/// Implementations must preserve insertion order per partition: `keys` returns
/// oldest first, and `write` on an existing key is delete + reinsert so the
/// key moves to the back of the order and loses its old eviction slot.
pub trait CacheBackend: Send + Sync {
  fn read(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>>;

  fn write(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<()>;

  fn remove(&self, partition: &str, key: &str) -> Result<()>;

  /// Keys in insertion order, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  fn count(&self, partition: &str) -> Result<usize>;

  /// All physical partition names present in storage.
  fn partitions(&self) -> Result<Vec<String>>;

  fn drop_partition(&self, partition: &str) -> Result<()>;
}

/// Stable fingerprint for a request: SHA-256 over the method and the
/// fragment-stripped URL, rendered as hex for fixed-length keys.
pub fn fingerprint(method: &Method, url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(normalized.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_fingerprint_is_stable() {
    let a = fingerprint(&Method::GET, &url("https://example.org/a?x=1"));
    let b = fingerprint(&Method::GET, &url("https://example.org/a?x=1"));
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
  }

  #[test]
  fn test_fingerprint_ignores_fragment() {
    let plain = fingerprint(&Method::GET, &url("https://example.org/page"));
    let fragment = fingerprint(&Method::GET, &url("https://example.org/page#section"));
    assert_eq!(plain, fragment);
  }

  #[test]
  fn test_fingerprint_distinguishes_method_and_path() {
    let get = fingerprint(&Method::GET, &url("https://example.org/a"));
    let head = fingerprint(&Method::HEAD, &url("https://example.org/a"));
    let other = fingerprint(&Method::GET, &url("https://example.org/b"));
    assert_ne!(get, head);
    assert_ne!(get, other);
  }

  #[test]
  fn test_entry_age_never_negative() {
    let mut entry = CacheEntry::new(ResponseData::offline());
    entry.stored_at = Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(entry.age_secs(), 0);
  }
}
