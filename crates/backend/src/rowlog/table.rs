//! Storage contract for the row log.
//!
//! Two keyspaces: message rows (payload + execution state, keyed by
//! [`MessageId`]) and shard entries (one per subscription that still owes
//! processing, keyed by `(subscription, MessageId)`). Conditional writes use a
//! per-row revision so state flips are all-or-nothing.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::message::{ExecutionState, MessageId};

/// Stored form of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
  pub payload: Option<Vec<u8>>,
  pub state: ExecutionState,
}

/// A message row as read back, with the revision to use for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRow {
  pub id: MessageId,
  pub row: MessageRow,
  pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogTableError {
  #[error("Conditional write on {0} lost to a concurrent update")]
  Conflict(String),
  #[error("Log storage unavailable: {0}")]
  Unavailable(String),
}

impl LogTableError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Unavailable(_))
  }
}

pub type Result<T> = std::result::Result<T, LogTableError>;

#[async_trait]
pub trait LogTable: Send + Sync {
  /// Write a message row. `expected_revision = None` means the row must not
  /// exist yet. Returns the new revision.
  async fn put_row(&self, id: &MessageId, row: MessageRow, expected_revision: Option<u64>) -> Result<u64>;

  async fn get_row(&self, id: &MessageId) -> Result<Option<VersionedRow>>;

  /// Delete a message row if it is still at `expected_revision`. Deleting a
  /// missing row succeeds.
  async fn delete_row(&self, id: &MessageId, expected_revision: u64) -> Result<()>;

  /// Message rows in id order, strictly after `after`.
  async fn scan_rows(&self, after: Option<&MessageId>, limit: usize) -> Result<Vec<VersionedRow>>;

  async fn put_shard_entry(&self, subscription: &str, id: &MessageId) -> Result<()>;

  /// Removing a missing entry succeeds.
  async fn remove_shard_entry(&self, subscription: &str, id: &MessageId) -> Result<()>;

  /// A subscription's shard entries in id order, strictly after `after`.
  async fn scan_shard(&self, subscription: &str, after: Option<&MessageId>, limit: usize) -> Result<Vec<MessageId>>;

  /// Subscriptions that currently have at least one shard entry.
  async fn shard_subscriptions(&self) -> Result<Vec<String>>;
}

// ============================================================================
// In-memory table
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
  rows: BTreeMap<MessageId, (MessageRow, u64)>,
  shard: BTreeSet<(String, MessageId)>,
}

/// Log table held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLogTable {
  tables: RwLock<Tables>,
  unavailable: AtomicBool,
}

impl MemoryLogTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every call fail with `Unavailable` until reset.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub async fn row_count(&self) -> usize {
    self.tables.read().await.rows.len()
  }

  fn check(&self) -> Result<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(LogTableError::Unavailable("memory table switched off".to_string()));
    }
    Ok(())
  }
}

#[async_trait]
impl LogTable for MemoryLogTable {
  async fn put_row(&self, id: &MessageId, row: MessageRow, expected_revision: Option<u64>) -> Result<u64> {
    self.check()?;
    let mut tables = self.tables.write().await;
    let current = tables.rows.get(id).map(|(_, revision)| *revision);

    let next = match (current, expected_revision) {
      (None, None) => 0,
      (Some(actual), Some(expected)) if actual == expected => actual + 1,
      _ => return Err(LogTableError::Conflict(id.to_string())),
    };

    tables.rows.insert(id.clone(), (row, next));
    Ok(next)
  }

  async fn get_row(&self, id: &MessageId) -> Result<Option<VersionedRow>> {
    self.check()?;
    let tables = self.tables.read().await;
    Ok(tables.rows.get(id).map(|(row, revision)| VersionedRow {
      id: id.clone(),
      row: row.clone(),
      revision: *revision,
    }))
  }

  async fn delete_row(&self, id: &MessageId, expected_revision: u64) -> Result<()> {
    self.check()?;
    let mut tables = self.tables.write().await;
    match tables.rows.get(id) {
      None => Ok(()),
      Some((_, revision)) if *revision == expected_revision => {
        tables.rows.remove(id);
        Ok(())
      }
      Some(_) => Err(LogTableError::Conflict(id.to_string())),
    }
  }

  async fn scan_rows(&self, after: Option<&MessageId>, limit: usize) -> Result<Vec<VersionedRow>> {
    self.check()?;
    let tables = self.tables.read().await;
    let rows = tables
      .rows
      .iter()
      .filter(|(id, _)| after.is_none_or(|after| *id > after))
      .take(limit)
      .map(|(id, (row, revision))| VersionedRow {
        id: id.clone(),
        row: row.clone(),
        revision: *revision,
      })
      .collect();
    Ok(rows)
  }

  async fn put_shard_entry(&self, subscription: &str, id: &MessageId) -> Result<()> {
    self.check()?;
    self
      .tables
      .write()
      .await
      .shard
      .insert((subscription.to_string(), id.clone()));
    Ok(())
  }

  async fn remove_shard_entry(&self, subscription: &str, id: &MessageId) -> Result<()> {
    self.check()?;
    self
      .tables
      .write()
      .await
      .shard
      .remove(&(subscription.to_string(), id.clone()));
    Ok(())
  }

  async fn scan_shard(&self, subscription: &str, after: Option<&MessageId>, limit: usize) -> Result<Vec<MessageId>> {
    self.check()?;
    let tables = self.tables.read().await;
    let ids = tables
      .shard
      .iter()
      .filter(|(sub, id)| sub == subscription && after.is_none_or(|after| id > after))
      .take(limit)
      .map(|(_, id)| id.clone())
      .collect();
    Ok(ids)
  }

  async fn shard_subscriptions(&self) -> Result<Vec<String>> {
    self.check()?;
    let tables = self.tables.read().await;
    let mut subs: Vec<String> = tables.shard.iter().map(|(sub, _)| sub.clone()).collect();
    subs.dedup();
    Ok(subs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn row() -> MessageRow {
    MessageRow {
      payload: None,
      state: ExecutionState::new(),
    }
  }

  #[tokio::test]
  async fn test_conditional_put() {
    let table = MemoryLogTable::new();
    let id = MessageId::new(1, "r", 0);

    assert_eq!(table.put_row(&id, row(), None).await, Ok(0));
    assert!(matches!(table.put_row(&id, row(), None).await, Err(LogTableError::Conflict(_))));
    assert_eq!(table.put_row(&id, row(), Some(0)).await, Ok(1));
    assert!(matches!(table.put_row(&id, row(), Some(0)).await, Err(LogTableError::Conflict(_))));

    assert!(matches!(table.delete_row(&id, 0).await, Err(LogTableError::Conflict(_))));
    table.delete_row(&id, 1).await.unwrap();
    assert_eq!(table.get_row(&id).await, Ok(None));
  }

  #[tokio::test]
  async fn test_shard_scan_is_per_subscription_and_ordered() {
    let table = MemoryLogTable::new();
    let ids: Vec<_> = (0..4).map(|seq| MessageId::new(5, "row", seq)).collect();
    for id in ids.iter().rev() {
      table.put_shard_entry("a", id).await.unwrap();
    }
    table.put_shard_entry("b", &ids[0]).await.unwrap();

    assert_eq!(table.scan_shard("a", None, 10).await.unwrap(), ids);
    assert_eq!(table.scan_shard("a", Some(&ids[1]), 1).await.unwrap(), vec![ids[2].clone()]);
    assert_eq!(table.scan_shard("b", None, 10).await.unwrap(), vec![ids[0].clone()]);
    assert_eq!(table.shard_subscriptions().await.unwrap(), vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_unavailable() {
    let table = MemoryLogTable::new();
    table.set_unavailable(true);
    let err = table.get_row(&MessageId::new(0, "r", 0)).await.unwrap_err();
    assert!(err.is_transient());
  }
}
