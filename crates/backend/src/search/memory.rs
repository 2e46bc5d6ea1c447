use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{IndexDocument, Result, SearchShard, ShardError};

/// Search shard held in memory. Added documents are visible immediately;
/// `commit` only counts.
#[derive(Debug)]
pub struct MemorySearchShard {
  name: String,
  documents: DashMap<String, IndexDocument>,
  reachable: AtomicBool,
  commits: AtomicUsize,
  writes: AtomicUsize,
}

impl MemorySearchShard {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      documents: DashMap::new(),
      reachable: AtomicBool::new(true),
      commits: AtomicUsize::new(0),
      writes: AtomicUsize::new(0),
    }
  }

  /// Simulate the shard going down (or coming back).
  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn get(&self, id: &str) -> Option<IndexDocument> {
    self.documents.get(id).map(|doc| doc.clone())
  }

  pub fn contains(&self, id: &str) -> bool {
    self.documents.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.documents.len()
  }

  pub fn is_empty(&self) -> bool {
    self.documents.is_empty()
  }

  /// Adds and deletes that reached the shard
  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn commit_count(&self) -> usize {
    self.commits.load(Ordering::SeqCst)
  }

  fn check_reachable(&self) -> Result<()> {
    if !self.reachable.load(Ordering::SeqCst) {
      return Err(ShardError::Connection {
        shard: self.name.clone(),
        message: "connection refused".to_string(),
      });
    }
    Ok(())
  }

  fn malformed(&self, message: impl Into<String>) -> ShardError {
    ShardError::Malformed {
      shard: self.name.clone(),
      message: message.into(),
    }
  }
}

#[async_trait]
impl SearchShard for MemorySearchShard {
  fn name(&self) -> &str {
    &self.name
  }

  async fn add_document(&self, document: IndexDocument) -> Result<()> {
    self.check_reachable()?;
    if document.id.is_empty() {
      return Err(self.malformed("document without id"));
    }
    if document.fields.keys().any(|field| field.is_empty()) {
      return Err(self.malformed(format!("empty field name in {}", document.id)));
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.documents.insert(document.id.clone(), document);
    Ok(())
  }

  async fn delete_document(&self, id: &str) -> Result<()> {
    self.check_reachable()?;
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.documents.remove(id);
    Ok(())
  }

  async fn commit(&self) -> Result<()> {
    self.check_reachable()?;
    self.commits.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_failures_are_classified() {
    let shard = MemorySearchShard::new("s1");

    let err = shard.add_document(IndexDocument::new("")).await.unwrap_err();
    assert!(matches!(err, ShardError::Malformed { .. }));
    assert!(!err.is_transient());

    shard.set_reachable(false);
    let err = shard.add_document(IndexDocument::new("d")).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(shard.write_count(), 0);
  }

  #[tokio::test]
  async fn test_add_replaces() {
    let shard = MemorySearchShard::new("s1");
    shard
      .add_document(IndexDocument::new("d").with_value("f", "1"))
      .await
      .unwrap();
    shard
      .add_document(IndexDocument::new("d").with_value("f", "2"))
      .await
      .unwrap();
    assert_eq!(shard.len(), 1);
    assert_eq!(shard.get("d").unwrap().value("f"), Some("2"));
  }
}
