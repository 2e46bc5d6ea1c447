//! Per-record advisory lock on top of the coordinator.
//!
//! A lock is an ephemeral node `{root}/{sha256(record_id)}` holding the
//! holder's token. It is released by [`RecordLocker::unlock`] or reclaimed
//! automatically when the holder's session ends. Ordinary record writes never
//! consult it; only indexing does.

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
  coordinator::{Coordinator, CoordinatorError, CreateMode, WatchEvent, child_path},
  domain::{config::LockConfig, record::RecordId},
};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
  #[error("Timed out after {waited:?} waiting for lock on {record_id}")]
  Timeout { record_id: String, waited: Duration },
  #[error("Lock on {0} is not held by this token")]
  NotHolder(String),
  #[error("Corrupt lock data: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Coordinator error: {0}")]
  Coordinator(#[from] CoordinatorError),
}

impl LockError {
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Timeout { .. } => true,
      Self::Coordinator(e) => e.is_transient(),
      Self::NotHolder(_) | Self::Serialization(_) => false,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockData {
  record_id: String,
  token: Uuid,
  acquired_at: DateTime<Utc>,
}

/// Proof of ownership returned by [`RecordLocker::lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
  record_id: RecordId,
  path: String,
  /// `None` when locking is disabled
  token: Option<Uuid>,
  acquired_at: DateTime<Utc>,
}

impl LockToken {
  pub fn record_id(&self) -> &RecordId {
    &self.record_id
  }

  pub fn acquired_at(&self) -> DateTime<Utc> {
    self.acquired_at
  }

  pub fn is_noop(&self) -> bool {
    self.token.is_none()
  }
}

pub struct RecordLocker {
  coordinator: Arc<dyn Coordinator>,
  root: String,
  timeout: Duration,
  enabled: bool,
  healthy: AtomicBool,
}

impl RecordLocker {
  pub fn new(coordinator: Arc<dyn Coordinator>, config: &LockConfig) -> Self {
    Self {
      coordinator,
      root: config.root.clone(),
      timeout: config.timeout(),
      enabled: config.enabled,
      healthy: AtomicBool::new(true),
    }
  }

  /// Same locker with locking switched off, for jobs that are single-writer
  /// by construction.
  pub fn disabled(&self) -> Self {
    Self {
      coordinator: Arc::clone(&self.coordinator),
      root: self.root.clone(),
      timeout: self.timeout,
      enabled: false,
      healthy: AtomicBool::new(true),
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  /// False once any unlock has failed.
  pub fn is_healthy(&self) -> bool {
    self.healthy.load(Ordering::SeqCst)
  }

  fn path(&self, record_id: &RecordId) -> String {
    let digest = Sha256::digest(record_id.to_string().as_bytes());
    child_path(&self.root, &hex::encode(digest))
  }

  /// Acquire the lock for `record_id`, waiting at most the configured timeout.
  pub async fn lock(&self, record_id: &RecordId) -> Result<LockToken, LockError> {
    let path = self.path(record_id);
    let acquired_at = Utc::now();

    if !self.enabled {
      return Ok(LockToken {
        record_id: record_id.clone(),
        path,
        token: None,
        acquired_at,
      });
    }

    let token = Uuid::new_v4();
    let data = serde_json::to_vec(&LockData {
      record_id: record_id.to_string(),
      token,
      acquired_at,
    })?;
    let started = Instant::now();
    let deadline = started + self.timeout;

    loop {
      // Subscribe before trying so a release in between is not missed
      let events = self.coordinator.watch();

      match self.coordinator.create(&path, data.clone(), CreateMode::Ephemeral).await {
        Ok(()) => {
          trace!(record_id = %record_id, "Lock acquired");
          return Ok(LockToken {
            record_id: record_id.clone(),
            path,
            token: Some(token),
            acquired_at: Utc::now(),
          });
        }
        Err(CoordinatorError::NodeExists(_)) => {}
        Err(e) => return Err(e.into()),
      }

      trace!(record_id = %record_id, "Lock held elsewhere, waiting");
      if tokio::time::timeout_at(deadline, wait_for_delete(events, &path))
        .await
        .is_err()
      {
        debug!(record_id = %record_id, "Lock wait timed out");
        return Err(LockError::Timeout {
          record_id: record_id.to_string(),
          waited: started.elapsed(),
        });
      }
    }
  }

  /// Release a lock. Fails if `token` no longer owns it.
  pub async fn unlock(&self, token: &LockToken) -> Result<(), LockError> {
    let Some(expected) = token.token else {
      return Ok(());
    };

    let node = self
      .coordinator
      .get(&token.path)
      .await?
      .ok_or_else(|| LockError::NotHolder(token.record_id.to_string()))?;
    let data: LockData = serde_json::from_slice(&node.data)?;
    if data.token != expected {
      return Err(LockError::NotHolder(token.record_id.to_string()));
    }

    match self.coordinator.delete(&token.path, Some(node.version)).await {
      Ok(()) => {
        trace!(record_id = %token.record_id, "Lock released");
        Ok(())
      }
      Err(CoordinatorError::NoNode(_) | CoordinatorError::BadVersion { .. }) => {
        Err(LockError::NotHolder(token.record_id.to_string()))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Release a lock, logging instead of returning a failure. The lock expires
  /// with the session anyway; the locker reports itself unhealthy.
  pub async fn unlock_log_failure(&self, token: &LockToken) {
    if let Err(e) = self.unlock(token).await {
      self.healthy.store(false, Ordering::SeqCst);
      warn!(record_id = %token.record_id, error = %e, "Failed to release record lock");
    }
  }

  /// Whether `token` still owns its lock.
  pub async fn has_lock(&self, token: &LockToken) -> Result<bool, LockError> {
    let Some(expected) = token.token else {
      return Ok(true);
    };
    match self.coordinator.get(&token.path).await? {
      Some(node) => {
        let data: LockData = serde_json::from_slice(&node.data)?;
        Ok(data.token == expected)
      }
      None => Ok(false),
    }
  }
}

async fn wait_for_delete(mut events: broadcast::Receiver<WatchEvent>, path: &str) {
  loop {
    match events.recv().await {
      Ok(WatchEvent::Deleted(deleted)) if deleted == path => return,
      Ok(_) => continue,
      Err(broadcast::error::RecvError::Lagged(_)) => return,
      // No more events will come; let the deadline decide
      Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
  }
}
