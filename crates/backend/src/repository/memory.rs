use std::{
  collections::{BTreeMap, HashSet},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{LAST_VTAG, RecordEvent, RecordEventKind, RecordStore, RepositoryError, Result, TypeCatalog};
use crate::{
  domain::record::{Record, RecordId},
  rowlog::RowLog,
};

/// Versioned record store held in memory.
///
/// With a row log attached, every mutation appends a message before it is
/// applied; if the append fails the mutation is not applied.
#[derive(Default)]
pub struct MemoryRecordStore {
  records: RwLock<BTreeMap<RecordId, Vec<Record>>>,
  rowlog: Option<Arc<RowLog>>,
  unavailable: AtomicBool,
}

impl MemoryRecordStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_rowlog(rowlog: Arc<RowLog>) -> Self {
    Self {
      rowlog: Some(rowlog),
      ..Self::default()
    }
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn check(&self) -> Result<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(RepositoryError::Unavailable("memory store switched off".to_string()));
    }
    Ok(())
  }

  async fn log(&self, id: &RecordId, event: RecordEvent) -> Result<()> {
    let Some(rowlog) = &self.rowlog else {
      return Ok(());
    };
    let payload = serde_json::to_vec(&event)?;
    rowlog.append(&id.to_row_key(), Some(payload)).await?;
    Ok(())
  }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
  async fn read(&self, id: &RecordId, version: Option<u64>) -> Result<Record> {
    self.check()?;
    let records = self.records.read().await;
    let versions = records
      .get(id)
      .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

    let found = match version {
      None => versions.last(),
      Some(version) => versions.iter().find(|r| r.version == version),
    };
    found.cloned().ok_or_else(|| match version {
      Some(version) => RepositoryError::VersionNotFound {
        id: id.to_string(),
        version,
      },
      None => RepositoryError::NotFound(id.to_string()),
    })
  }

  async fn create_or_update(&self, mut record: Record) -> Result<Record> {
    self.check()?;
    let mut records = self.records.write().await;
    let previous = records.get(&record.id).and_then(|versions| versions.last());
    let kind = if previous.is_some() {
      RecordEventKind::Update
    } else {
      RecordEventKind::Create
    };
    record.version = previous.map(|r| r.version + 1).unwrap_or(1);

    self
      .log(
        &record.id,
        RecordEvent {
          kind,
          version: Some(record.version),
        },
      )
      .await?;

    debug!(record_id = %record.id, version = record.version, "Record stored");
    records.entry(record.id.clone()).or_default().push(record.clone());
    Ok(record)
  }

  async fn delete(&self, id: &RecordId) -> Result<()> {
    self.check()?;
    let mut records = self.records.write().await;
    if !records.contains_key(id) {
      return Err(RepositoryError::NotFound(id.to_string()));
    }
    self
      .log(
        id,
        RecordEvent {
          kind: RecordEventKind::Delete,
          version: None,
        },
      )
      .await?;
    records.remove(id);
    debug!(record_id = %id, "Record deleted");
    Ok(())
  }

  async fn scan(&self, after: Option<&RecordId>, limit: usize) -> Result<Vec<RecordId>> {
    self.check()?;
    let records = self.records.read().await;
    Ok(
      records
        .keys()
        .filter(|id| after.is_none_or(|after| *id > after))
        .take(limit)
        .cloned()
        .collect(),
    )
  }
}

/// Fixed set of known version tags. `last` is always known.
#[derive(Debug, Clone, Default)]
pub struct MemoryTypeCatalog {
  version_tags: HashSet<String>,
}

impl MemoryTypeCatalog {
  pub fn new<I, S>(version_tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      version_tags: version_tags.into_iter().map(Into::into).collect(),
    }
  }
}

impl TypeCatalog for MemoryTypeCatalog {
  fn has_version_tag(&self, tag: &str) -> bool {
    tag == LAST_VTAG || self.version_tags.contains(tag)
  }
}
