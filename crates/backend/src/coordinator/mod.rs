//! Coordination service contract.
//!
//! The pipeline needs a hierarchical key store with ephemeral nodes (bound to a
//! client session), conditional updates, and change watches. The subscription
//! registry and the record lock are both built on top of it.
//!
//! [`MemoryCoordinator`] is an in-process implementation used by tests and the
//! demo pipeline.

mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::MemoryCoordinator;

/// Identifies the client session ephemeral nodes are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// Lifetime of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
  /// Lives until explicitly deleted
  Persistent,
  /// Removed when the creating session ends
  Ephemeral,
}

/// Node data with its version (incremented on every `set`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  pub data: Vec<u8>,
  pub version: u64,
}

/// Structural change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
  Created(String),
  Changed(String),
  Deleted(String),
}

impl WatchEvent {
  pub fn path(&self) -> &str {
    match self {
      Self::Created(path) | Self::Changed(path) | Self::Deleted(path) => path,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
  #[error("Node already exists: {0}")]
  NodeExists(String),
  #[error("No such node: {0}")]
  NoNode(String),
  #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
  BadVersion { path: String, expected: u64, actual: u64 },
  #[error("Node {0} has children")]
  NotEmpty(String),
  #[error("Invalid path: {0}")]
  InvalidPath(String),
  #[error("Coordinator connection lost")]
  ConnectionLoss,
  #[error("Session {0} expired")]
  SessionExpired(SessionId),
}

impl CoordinatorError {
  /// Errors that may succeed when the operation is repeated later.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::ConnectionLoss | Self::SessionExpired(_))
  }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[async_trait]
pub trait Coordinator: Send + Sync {
  /// The session ephemeral nodes created through this handle belong to.
  fn session(&self) -> SessionId;

  /// Create a node. Missing parents are created as persistent nodes.
  async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

  async fn get(&self, path: &str) -> Result<Option<Node>>;

  /// Replace node data. With `expected_version` the update only applies if the
  /// node is still at that version. Returns the new version.
  async fn set(&self, path: &str, data: Vec<u8>, expected_version: Option<u64>) -> Result<u64>;

  async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()>;

  /// Names (not full paths) of the direct children, sorted.
  async fn children(&self, path: &str) -> Result<Vec<String>>;

  /// Subscribe to changes of any node. Receivers filter by path.
  fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
  if parent.ends_with('/') {
    format!("{}{}", parent, child)
  } else {
    format!("{}/{}", parent, child)
  }
}

/// Validate a coordinator path: absolute, no empty segments, no trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
  let invalid = !path.starts_with('/')
    || (path.len() > 1 && path.ends_with('/'))
    || path.split('/').skip(1).any(|segment| segment.is_empty() && path != "/");
  if invalid {
    return Err(CoordinatorError::InvalidPath(path.to_string()));
  }
  Ok(())
}
