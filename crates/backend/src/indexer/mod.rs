//! Indexing of a single record.
//!
//! [`Indexer::index`] re-reads the record, matches it against the current
//! index rules and ships one document per matched version tag to the shard the
//! record routes to. Locking and acknowledgement are the caller's business
//! (see `worker::IndexUpdater`).

mod document;
mod metrics;

use std::sync::Arc;

use tracing::{debug, trace};

pub use self::{
  document::{DocumentBuilder, SYSTEM_FIELDS, document_id},
  metrics::{Counter, IndexerMetrics, MetricsSink, MetricsSnapshot},
};
use crate::{
  conf::{GenerationHandle, IndexerGeneration},
  domain::record::{Record, RecordId},
  repository::{LAST_VTAG, RecordStore, RepositoryError},
  search::{ShardError, ShardManager},
};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error("Record store error: {0}")]
  Repository(#[from] RepositoryError),
  #[error("Search shard error: {0}")]
  Shard(#[from] ShardError),
  #[error("Record {record_id} cannot be indexed: {reason}")]
  Unindexable { record_id: String, reason: String },
}

impl IndexError {
  /// Transient errors leave the message pending; the rest are terminal for it.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Repository(e) => e.is_transient(),
      Self::Shard(e) => e.is_transient(),
      Self::Unindexable { .. } => false,
    }
  }
}

/// What indexing did for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
  /// A case matched: `added` documents written, `removed` documents deleted
  /// for matched tags the record does not carry
  Indexed { added: usize, removed: usize },
  /// No case matched, nothing written
  Skipped,
  /// The record no longer exists; its possible documents were deleted
  Deleted { removed: usize },
}

pub struct Indexer {
  store: Arc<dyn RecordStore>,
  generations: Arc<GenerationHandle>,
  shards: Arc<ShardManager>,
}

impl Indexer {
  pub fn new(store: Arc<dyn RecordStore>, generations: Arc<GenerationHandle>, shards: Arc<ShardManager>) -> Self {
    Self {
      store,
      generations,
      shards,
    }
  }

  pub fn generations(&self) -> &Arc<GenerationHandle> {
    &self.generations
  }

  pub fn shards(&self) -> &Arc<ShardManager> {
    &self.shards
  }

  pub async fn index(&self, record_id: &RecordId) -> Result<IndexOutcome, IndexError> {
    // One generation for the whole record
    let generation = self.generations.current();

    let record = match self.store.read(record_id, None).await {
      Ok(record) => record,
      Err(RepositoryError::NotFound(_)) => return self.delete_all(&generation, record_id).await,
      Err(e) => return Err(e.into()),
    };

    let Some(case) = generation
      .conf
      .matching_case(&record.record_type, record.id.variant_properties())
    else {
      trace!(record_id = %record_id, record_type = %record.record_type, "No matching case");
      return Ok(IndexOutcome::Skipped);
    };

    let mut added = 0;
    let mut removed = 0;
    for vtag in case.version_tags() {
      let doc_id = document_id(record_id, vtag);

      let Some(version) = tagged_version(&record, vtag) else {
        self.shards.delete_document(&generation.shard_map, record_id, &doc_id).await?;
        removed += 1;
        continue;
      };

      let document = if version == record.version {
        DocumentBuilder::build(&record, vtag, generation.conf.fields())?
      } else {
        let tagged = match self.store.read(record_id, Some(version)).await {
          Ok(tagged) => tagged,
          Err(RepositoryError::VersionNotFound { version, .. }) => {
            return Err(IndexError::Unindexable {
              record_id: record_id.to_string(),
              reason: format!("version tag '{}' points at missing version {}", vtag, version),
            });
          }
          Err(e) => return Err(e.into()),
        };
        DocumentBuilder::build(&tagged, vtag, generation.conf.fields())?
      };

      self
        .shards
        .add_document(&generation.shard_map, record_id, document)
        .await?;
      added += 1;
    }

    debug!(record_id = %record_id, added, removed, generation = generation.number, "Record indexed");
    Ok(IndexOutcome::Indexed { added, removed })
  }

  async fn delete_all(&self, generation: &IndexerGeneration, record_id: &RecordId) -> Result<IndexOutcome, IndexError> {
    let mut removed = 0;
    for vtag in generation.conf.all_version_tags() {
      self
        .shards
        .delete_document(&generation.shard_map, record_id, &document_id(record_id, &vtag))
        .await?;
      removed += 1;
    }
    debug!(record_id = %record_id, removed, "Record gone, documents deleted");
    Ok(IndexOutcome::Deleted { removed })
  }
}

fn tagged_version(record: &Record, vtag: &str) -> Option<u64> {
  if vtag == LAST_VTAG {
    Some(record.version)
  } else {
    record.version_tags.get(vtag).copied()
  }
}
