//! Bounded, versioned cache store with memory and SQLite backends.
//!
//! Backends only provide ordered storage primitives; the bounded semantics
//! (FIFO capacity eviction, sweep-on-read expiry, generation naming) live in
//! `CacheStore` so they hold for every backend.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::traits::{CacheBackend, CacheEntry};
use crate::config::CacheConfig;
use crate::fetch::ResponseData;

/// Fallback bounds for partitions the configuration does not mention.
const DEFAULT_MAX_ENTRIES: usize = 50;
const DEFAULT_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Capacity and freshness bounds for one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionLimits {
  pub max_entries: usize,
  pub max_age: Duration,
}

impl Default for PartitionLimits {
  fn default() -> Self {
    Self {
      max_entries: DEFAULT_MAX_ENTRIES,
      max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
    }
  }
}

/// Point-in-time stats for one partition, as reported over the control
/// channel.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
  pub name: String,
  pub entries: usize,
  pub max_entries: usize,
  pub last_write: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
  pub partitions: Vec<PartitionStats>,
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Default)]
struct PartitionData {
  /// Keys in insertion order, oldest at the front.
  order: VecDeque<String>,
  entries: HashMap<String, CacheEntry>,
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
  partitions: Mutex<HashMap<String, PartitionData>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PartitionData>>> {
    self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheBackend for MemoryBackend {
  fn read(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .and_then(|data| data.entries.get(key))
        .cloned(),
    )
  }

  fn write(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<()> {
    let mut partitions = self.lock()?;
    let data = partitions.entry(partition.to_string()).or_default();

    // Overwrite is delete + reinsert so the key moves to the back of the order.
    if data.entries.contains_key(key) {
      data.order.retain(|k| k != key);
    }
    data.order.push_back(key.to_string());
    data.entries.insert(key.to_string(), entry.clone());

    Ok(())
  }

  fn remove(&self, partition: &str, key: &str) -> Result<()> {
    let mut partitions = self.lock()?;
    if let Some(data) = partitions.get_mut(partition) {
      data.entries.remove(key);
      data.order.retain(|k| k != key);
    }
    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .map(|data| data.order.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .map(|data| data.entries.len())
        .unwrap_or(0),
    )
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .iter()
        .filter(|(_, data)| !data.entries.is_empty())
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn drop_partition(&self, partition: &str) -> Result<()> {
    let mut partitions = self.lock()?;
    partitions.remove(partition);
    Ok(())
  }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Schema for the cache table. `position` is monotonically increasing per
/// partition and carries the FIFO order.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (partition, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_position
    ON cache_entries(partition, position);
"#;

/// SQLite-backed storage for persistent caching across agent restarts.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open the backend at the given path, or the platform data directory.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;

    Ok(backend)
  }

  /// In-memory database, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory db: {}", e))?;

    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;

    Ok(backend)
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sidecache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheBackend for SqliteBackend {
  fn read(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE partition = ? AND fingerprint = ?",
      )
      .map_err(|e| eyre!("Failed to prepare read: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![partition, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;
        Ok(Some(CacheEntry {
          response: ResponseData {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn write(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;

    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Delete + reinsert keeps overwritten keys from retaining their old
    // position in the FIFO order.
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND fingerprint = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to delete old entry: {}", e))?;

    conn
      .execute(
        "INSERT INTO cache_entries (partition, fingerprint, status, headers, body, stored_at, position)
         VALUES (?, ?, ?, ?, ?, ?,
           (SELECT COALESCE(MAX(position) + 1, 0) FROM cache_entries WHERE partition = ?))",
        params![
          partition,
          key,
          entry.response.status,
          headers,
          entry.response.body,
          entry.stored_at.to_rfc3339(),
          partition
        ],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn remove(&self, partition: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND fingerprint = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to remove entry: {}", e))?;
    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT fingerprint FROM cache_entries WHERE partition = ? ORDER BY position")
      .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(count as usize)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT partition FROM cache_entries")
      .map_err(|e| eyre!("Failed to prepare partition listing: {}", e))?;

    let partitions = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(partitions)
  }

  fn drop_partition(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to drop partition: {}", e))?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp back out of storage.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

// ============================================================================
// Bounded store
// ============================================================================

/// Bounded, versioned cache store over a storage backend.
///
/// Callers address partitions by logical name ("static", "dynamic"); the
/// store maps them onto versioned physical partitions (`static-v2`) so that
/// generation cleanup can tell current storage from stale storage.
pub struct CacheStore<B: CacheBackend> {
  backend: Arc<B>,
  version: u32,
  /// Bounds by logical name, in configuration order.
  limits: Vec<(String, PartitionLimits)>,
}

impl<B: CacheBackend> CacheStore<B> {
  pub fn new(backend: B, config: &CacheConfig) -> Self {
    let limits = config
      .partitions
      .iter()
      .map(|p| {
        (
          p.name.clone(),
          PartitionLimits {
            max_entries: p.max_entries,
            max_age: Duration::seconds(p.max_age_secs),
          },
        )
      })
      .collect();

    Self {
      backend: Arc::new(backend),
      version: config.version,
      limits,
    }
  }

  /// Physical name of a logical partition in the current generation.
  pub fn physical(&self, partition: &str) -> String {
    format!("{}-v{}", partition, self.version)
  }

  /// Physical names of every configured partition in the current generation.
  pub fn current_names(&self) -> Vec<String> {
    self
      .limits
      .iter()
      .map(|(name, _)| self.physical(name))
      .collect()
  }

  /// Logical partition names in configuration order.
  pub fn partition_names(&self) -> Vec<String> {
    self.limits.iter().map(|(name, _)| name.clone()).collect()
  }

  fn limits_for(&self, partition: &str) -> PartitionLimits {
    self
      .limits
      .iter()
      .find(|(name, _)| name == partition)
      .map(|(_, limits)| *limits)
      .unwrap_or_default()
  }

  /// Look up an entry, sweeping it if expired.
  ///
  /// An entry older than the partition's `max_age` is treated as absent and
  /// deleted on the spot; freshness is only meaningful when something is
  /// actually requested, so no background timer is involved.
  pub fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>> {
    let physical = self.physical(partition);
    let entry = match self.backend.read(&physical, key)? {
      Some(entry) => entry,
      None => return Ok(None),
    };

    let limits = self.limits_for(partition);
    if entry.age_secs() > limits.max_age.num_seconds() {
      debug!(partition, key, age_secs = entry.age_secs(), "Sweeping expired entry");
      if let Err(e) = self.backend.remove(&physical, key) {
        warn!(partition, key, error = %e, "Failed to sweep expired entry");
      }
      return Ok(None);
    }

    Ok(Some(entry))
  }

  /// Look up an entry without sweeping, reporting whether it is expired.
  ///
  /// Stale-while-revalidate serves expired entries by design, so it needs a
  /// read that tolerates them.
  pub fn get_any(&self, partition: &str, key: &str) -> Result<Option<(CacheEntry, bool)>> {
    let entry = match self.backend.read(&self.physical(partition), key)? {
      Some(entry) => entry,
      None => return Ok(None),
    };

    let limits = self.limits_for(partition);
    let expired = entry.age_secs() > limits.max_age.num_seconds();
    Ok(Some((entry, expired)))
  }

  /// Insert a response, evicting the single oldest entry first when the
  /// partition is at capacity.
  ///
  /// Overwriting an existing key does not change the entry count, so it never
  /// triggers an eviction.
  pub fn put(&self, partition: &str, key: &str, response: ResponseData) -> Result<()> {
    let physical = self.physical(partition);
    let limits = self.limits_for(partition);

    let exists = self.backend.read(&physical, key)?.is_some();
    if !exists && self.backend.count(&physical)? >= limits.max_entries {
      if let Some(oldest) = self.backend.keys(&physical)?.into_iter().next() {
        debug!(partition, key = %oldest, "Evicting oldest entry at capacity");
        self.backend.remove(&physical, &oldest)?;
      }
    }

    self.backend.write(&physical, key, &CacheEntry::new(response))
  }

  /// Full sweep of one partition; bounds growth during idle periods.
  pub fn evict_expired(&self, partition: &str) -> Result<usize> {
    let physical = self.physical(partition);
    let limits = self.limits_for(partition);
    let mut swept = 0;

    for key in self.backend.keys(&physical)? {
      if let Some(entry) = self.backend.read(&physical, &key)? {
        if entry.age_secs() > limits.max_age.num_seconds() {
          self.backend.remove(&physical, &key)?;
          swept += 1;
        }
      }
    }

    Ok(swept)
  }

  /// Stats for every configured partition in the current generation.
  pub fn stats(&self) -> Result<CacheStats> {
    let mut partitions = Vec::new();

    for (name, limits) in &self.limits {
      let physical = self.physical(name);
      let mut last_write = None;

      for key in self.backend.keys(&physical)? {
        if let Some(entry) = self.backend.read(&physical, &key)? {
          if last_write.map(|t| entry.stored_at > t).unwrap_or(true) {
            last_write = Some(entry.stored_at);
          }
        }
      }

      partitions.push(PartitionStats {
        name: physical.clone(),
        entries: self.backend.count(&physical)?,
        max_entries: limits.max_entries,
        last_write,
      });
    }

    Ok(CacheStats { partitions })
  }

  /// Delete every partition present in storage, current generation included.
  pub fn clear_all(&self) -> Result<()> {
    for partition in self.backend.partitions()? {
      self.backend.drop_partition(&partition)?;
    }
    Ok(())
  }

  /// Physical partitions that do not belong to the current generation.
  pub fn stale_partitions(&self) -> Result<Vec<String>> {
    let current = self.current_names();
    Ok(
      self
        .backend
        .partitions()?
        .into_iter()
        .filter(|name| !current.contains(name))
        .collect(),
    )
  }

  /// Drop every stale generation; returns the dropped partition names.
  pub fn drop_stale_generations(&self) -> Result<Vec<String>> {
    let stale = self.stale_partitions()?;
    for name in &stale {
      self.backend.drop_partition(name)?;
    }
    Ok(stale)
  }
}

impl<B: CacheBackend> Clone for CacheStore<B> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      version: self.version,
      limits: self.limits.clone(),
    }
  }
}

// ============================================================================
// Tests
// ============================================================================
