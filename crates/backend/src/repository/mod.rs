//! Record store and type catalog contracts.
//!
//! The indexing pipeline only reads records; writers go through
//! [`RecordStore::create_or_update`] and [`RecordStore::delete`], which append
//! a row log message as part of the mutation.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{MemoryRecordStore, MemoryTypeCatalog};

use crate::{
  domain::record::{Record, RecordId},
  rowlog::RowLogError,
};

/// Version tag that always points at the latest version.
pub const LAST_VTAG: &str = "last";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
  #[error("Record not found: {0}")]
  NotFound(String),
  #[error("Record {id} has no version {version}")]
  VersionNotFound { id: String, version: u64 },
  #[error("Record store unavailable: {0}")]
  Unavailable(String),
  #[error("Failed to log mutation: {0}")]
  RowLog(#[from] RowLogError),
  #[error("Failed to encode mutation event: {0}")]
  Encode(#[from] serde_json::Error),
}

impl RepositoryError {
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Unavailable(_) => true,
      Self::RowLog(e) => e.is_transient(),
      Self::NotFound(_) | Self::VersionNotFound { .. } | Self::Encode(_) => false,
    }
  }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// What happened to a record; the payload of its row log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordEventKind {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent {
  #[serde(rename = "type")]
  pub kind: RecordEventKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<u64>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
  /// Read a specific version, or the latest with `None`.
  async fn read(&self, id: &RecordId, version: Option<u64>) -> Result<Record>;

  /// Store a new version. The returned record carries the assigned version.
  async fn create_or_update(&self, record: Record) -> Result<Record>;

  async fn delete(&self, id: &RecordId) -> Result<()>;

  /// Record ids in order, strictly after `after`.
  async fn scan(&self, after: Option<&RecordId>, limit: usize) -> Result<Vec<RecordId>>;
}

/// Schema metadata the index configuration is validated against.
pub trait TypeCatalog: Send + Sync {
  fn has_version_tag(&self, tag: &str) -> bool;
}
