//! Search backend contract and shard routing.
//!
//! [`ShardManager`] owns one [`SearchShard`] per configured shard name and
//! sends each document to the shard the current [`ShardMap`] selects for its
//! record. Connection failures and rejected documents are reported as distinct
//! errors so the caller can retry the former and give up on the latter.

mod memory;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

pub use memory::MemorySearchShard;

use crate::{conf::ShardMap, domain::record::RecordId};

/// A document as shipped to a search shard. Multi-valued fields keep their order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexDocument {
  pub id: String,
  pub fields: BTreeMap<String, Vec<String>>,
}

impl IndexDocument {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      fields: BTreeMap::new(),
    }
  }

  pub fn add_value(&mut self, field: impl Into<String>, value: impl Into<String>) {
    self.fields.entry(field.into()).or_default().push(value.into());
  }

  pub fn with_value(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.add_value(field, value);
    self
  }

  /// First value of a field
  pub fn value(&self, field: &str) -> Option<&str> {
    self.fields.get(field).and_then(|values| values.first()).map(String::as_str)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
  #[error("Shard {shard} unreachable: {message}")]
  Connection { shard: String, message: String },
  #[error("Shard {shard} rejected document: {message}")]
  Malformed { shard: String, message: String },
  #[error("No search shard named {0}")]
  UnknownShard(String),
}

impl ShardError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Connection { .. })
  }
}

pub type Result<T> = std::result::Result<T, ShardError>;

#[async_trait]
pub trait SearchShard: Send + Sync {
  fn name(&self) -> &str;

  /// Add or replace a document.
  async fn add_document(&self, document: IndexDocument) -> Result<()>;

  /// Deleting an unknown id succeeds.
  async fn delete_document(&self, id: &str) -> Result<()>;

  async fn commit(&self) -> Result<()>;
}

pub struct ShardManager {
  shards: BTreeMap<String, Arc<dyn SearchShard>>,
}

impl ShardManager {
  pub fn new(shards: impl IntoIterator<Item = Arc<dyn SearchShard>>) -> Self {
    Self {
      shards: shards
        .into_iter()
        .map(|shard| (shard.name().to_string(), shard))
        .collect(),
    }
  }

  pub fn shard(&self, name: &str) -> Result<&Arc<dyn SearchShard>> {
    self
      .shards
      .get(name)
      .ok_or_else(|| ShardError::UnknownShard(name.to_string()))
  }

  /// Shard responsible for `record_id` under `shard_map`.
  pub fn route(&self, shard_map: &ShardMap, record_id: &RecordId) -> Result<&Arc<dyn SearchShard>> {
    self.shard(shard_map.select_shard(record_id))
  }

  pub async fn add_document(&self, shard_map: &ShardMap, record_id: &RecordId, document: IndexDocument) -> Result<()> {
    let shard = self.route(shard_map, record_id)?;
    debug!(record_id = %record_id, shard = shard.name(), document = %document.id, "Adding document");
    shard.add_document(document).await
  }

  pub async fn delete_document(&self, shard_map: &ShardMap, record_id: &RecordId, id: &str) -> Result<()> {
    let shard = self.route(shard_map, record_id)?;
    debug!(record_id = %record_id, shard = shard.name(), document = id, "Deleting document");
    shard.delete_document(id).await
  }

  /// Commit every shard; returns the first failure after trying all.
  pub async fn commit_all(&self) -> Result<()> {
    let results = join_all(self.shards.values().map(|shard| shard.commit())).await;
    let mut first_error = None;
    for (name, result) in self.shards.keys().zip(results) {
      if let Err(e) = result {
        warn!(shard = %name, error = %e, "Commit failed");
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager() -> (ShardManager, Arc<MemorySearchShard>, Arc<MemorySearchShard>) {
    let a = Arc::new(MemorySearchShard::new("a"));
    let b = Arc::new(MemorySearchShard::new("b"));
    let manager = ShardManager::new([a.clone() as Arc<dyn SearchShard>, b.clone() as Arc<dyn SearchShard>]);
    (manager, a, b)
  }

  #[tokio::test]
  async fn test_routes_by_shard_map() {
    let (manager, a, b) = manager();
    let shard_map = ShardMap::from_json(
      &[("a", "mem://a"), ("b", "mem://b")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      r#"{"rules":[{"match":{"prefix":"A"},"shard":"a"},{"match":{"prefix":""},"shard":"b"}]}"#,
    )
    .unwrap();

    let alpha = RecordId::new("Alpha");
    let beta = RecordId::new("Beta");
    manager
      .add_document(&shard_map, &alpha, IndexDocument::new("Alpha-live"))
      .await
      .unwrap();
    manager
      .add_document(&shard_map, &beta, IndexDocument::new("Beta-live"))
      .await
      .unwrap();

    assert!(a.contains("Alpha-live"));
    assert!(b.contains("Beta-live"));

    manager.delete_document(&shard_map, &alpha, "Alpha-live").await.unwrap();
    assert!(!a.contains("Alpha-live"));
  }

  #[tokio::test]
  async fn test_commit_all_reports_failure() {
    let (manager, a, b) = manager();
    b.set_reachable(false);
    let err = manager.commit_all().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(a.commit_count(), 1);
  }

  #[test]
  fn test_unknown_shard() {
    let (manager, _, _) = manager();
    assert_eq!(
      manager.shard("zzz").err(),
      Some(ShardError::UnknownShard("zzz".to_string()))
    );
  }

  #[test]
  fn test_document_values() {
    let doc = IndexDocument::new("d").with_value("tag", "x").with_value("tag", "y");
    assert_eq!(doc.value("tag"), Some("x"));
    assert_eq!(doc.fields["tag"], vec!["x", "y"]);
  }
}
