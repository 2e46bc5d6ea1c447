//! Process configuration for rowdex.
//!
//! Loaded from a TOML file. Every section has defaults, so an empty file (or no
//! file at all via [`Config::load_or_default`]) yields a working setup.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Row Log Configuration
// ============================================================================

/// Message log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RowLogConfig {
  /// Identifier of the row log (used in coordinator paths)
  pub id: String,

  /// Root path in the coordinator under which subscriptions are registered
  pub coordinator_root: String,

  /// Wake idle processors when a message is appended (default: true)
  pub notify_enabled: bool,

  /// Minimum time between two wake-up notifications (default: 100)
  pub notify_delay_ms: u64,

  /// Payloads up to this size are delivered with the message (default: 1024)
  pub inline_payload_limit: usize,

  /// Rows fetched per storage scan while filling a batch (default: 256)
  pub scan_page_size: usize,

  /// Attempts at a conditional state update before giving up (default: 10)
  pub max_state_retries: u32,

  /// Log a warning once a message has failed this many times for a subscription (default: 3)
  pub warn_after_tries: u32,
}

impl Default for RowLogConfig {
  fn default() -> Self {
    Self {
      id: "mq".to_string(),
      coordinator_root: "/rowdex/rowlog".to_string(),
      notify_enabled: true,
      notify_delay_ms: 100,
      inline_payload_limit: 1024,
      scan_page_size: 256,
      max_state_retries: 10,
      warn_after_tries: 3,
    }
  }
}

impl RowLogConfig {
  pub fn notify_delay(&self) -> Duration {
    Duration::from_millis(self.notify_delay_ms)
  }
}

// ============================================================================
// Indexer Configuration
// ============================================================================

/// Indexing worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
  /// Name of the index (used in logs and metrics)
  pub name: String,

  /// Subscription the indexer consumes (default: "indexer")
  pub subscription_id: String,

  /// Worker count; 0 means one per CPU (default: 0)
  pub workers: usize,

  /// Pending-task queue bound; when full the submitter runs the task itself (default: 1000)
  pub queue_capacity: usize,

  /// Messages requested per `next` call (default: 100)
  pub batch_size: usize,

  /// Time in-flight work may take to finish on shutdown (default: 30)
  pub shutdown_grace_secs: u64,

  /// Time a batch build may take to drain after the last submission (default: 300)
  pub batch_build_timeout_secs: u64,

  /// Path of the index-rule document (TOML)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub indexer_conf: Option<PathBuf>,

  /// Path of the sharding rule document (JSON); hash routing if unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sharding_conf: Option<PathBuf>,

  /// Search shards by name -> address
  pub shards: BTreeMap<String, String>,
}

impl Default for IndexerSettings {
  fn default() -> Self {
    Self {
      name: "default".to_string(),
      subscription_id: "indexer".to_string(),
      workers: 0,
      queue_capacity: 1000,
      batch_size: 100,
      shutdown_grace_secs: 30,
      batch_build_timeout_secs: 300,
      indexer_conf: None,
      sharding_conf: None,
      shards: BTreeMap::new(),
    }
  }
}

impl IndexerSettings {
  /// Effective worker count
  pub fn worker_count(&self) -> usize {
    if self.workers == 0 { num_cpus::get() } else { self.workers }
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }

  pub fn batch_build_timeout(&self) -> Duration {
    Duration::from_secs(self.batch_build_timeout_secs)
  }
}

// ============================================================================
// Lock Configuration
// ============================================================================

/// Record lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
  /// Disable only where single-writer access is guaranteed (default: true)
  pub enabled: bool,

  /// How long `lock` may wait for the current holder (default: 10000)
  pub timeout_ms: u64,

  /// Coordinator path under which lock nodes live
  pub root: String,
}

impl Default for LockConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      timeout_ms: 10_000,
      root: "/rowdex/indexer/recordlock".to_string(),
    }
  }
}

impl LockConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default log level: off, error, warn, info, debug, trace (default: info)
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
    }
  }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub rowlog: RowLogConfig,
  pub indexer: IndexerSettings,
  pub lock: LockConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

impl Config {
  /// Load and validate a configuration file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Load a configuration file, falling back to defaults if it is missing or broken.
  pub fn load_or_default(path: &Path) -> Self {
    if !path.exists() {
      return Self::default();
    }
    match Self::load(path) {
      Ok(config) => config,
      Err(e) => {
        warn!(error = %e, "Falling back to default configuration");
        Self::default()
      }
    }
  }

  /// Default location of the user configuration file.
  pub fn user_config_path() -> Option<PathBuf> {
    std::env::var_os("ROWDEX_CONFIG").map(PathBuf::from)
  }

  /// Paths in the indexer section are resolved relative to the config file.
  pub fn resolve_paths(&mut self, base: &Path) {
    for path in [&mut self.indexer.indexer_conf, &mut self.indexer.sharding_conf]
      .into_iter()
      .flatten()
    {
      if path.is_relative() {
        *path = base.join(&*path);
      }
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.indexer.batch_size == 0 {
      return Err(ConfigError::Invalid("indexer.batch_size must be at least 1".to_string()));
    }
    if self.indexer.queue_capacity == 0 {
      return Err(ConfigError::Invalid("indexer.queue_capacity must be at least 1".to_string()));
    }
    if self.rowlog.scan_page_size == 0 {
      return Err(ConfigError::Invalid("rowlog.scan_page_size must be at least 1".to_string()));
    }
    if !self.rowlog.coordinator_root.starts_with('/') || !self.lock.root.starts_with('/') {
      return Err(ConfigError::Invalid("coordinator paths must be absolute".to_string()));
    }
    Ok(())
  }
}
