//! Agent configuration.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::routes::RouteRule;

fn default_max_entries() -> usize {
  50
}

fn default_max_age_secs() -> i64 {
  24 * 60 * 60
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin whose requests the agent intercepts.
  pub origin: String,
  pub cache: CacheConfig,
  /// Paths prefetched into the static partition during install.
  pub precache: Vec<String>,
  /// Route rules evaluated in order; empty means the built-in defaults.
  pub routes: Vec<RouteRule>,
  /// Seconds between maintenance ticks.
  pub tick_secs: u64,
  /// Seconds between connectivity probes.
  pub probe_secs: u64,
}

/// Cache generation version and partition bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bumping this and redeploying retires the previous generation.
  pub version: u32,
  pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
  pub name: String,
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
  #[serde(default = "default_max_age_secs")]
  pub max_age_secs: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      cache: CacheConfig::default(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
        "/styles/main.css".to_string(),
        "/scripts/app.js".to_string(),
      ],
      routes: Vec::new(),
      tick_secs: 30,
      probe_secs: 15,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: 1,
      partitions: vec![
        PartitionConfig {
          name: "static".to_string(),
          max_entries: 60,
          max_age_secs: 7 * 24 * 60 * 60,
        },
        PartitionConfig {
          name: "dynamic".to_string(),
          max_entries: 40,
          max_age_secs: 24 * 60 * 60,
        },
        PartitionConfig {
          name: "images".to_string(),
          max_entries: 30,
          max_age_secs: 7 * 24 * 60 * 60,
        },
      ],
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sidecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sidecache/config.yaml
  ///
  /// With no file anywhere the built-in defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found; using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sidecache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sidecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }
}
