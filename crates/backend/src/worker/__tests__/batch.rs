//! Batch build E2E tests.

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use async_trait::async_trait;
  use serde_json::json;

  use crate::{
    domain::record::{QName, Record, RecordId},
    indexer::Indexer,
    repository::{MemoryRecordStore, RecordStore, Result},
    worker::{BatchBuilder, BatchError, BatchReport, IndexUpdater, __tests__::helpers::PipelineTestContext},
  };

  fn builder(ctx: &PipelineTestContext) -> BatchBuilder {
    let updater = Arc::new(IndexUpdater::new(
      ctx.updater.indexer().clone(),
      Arc::new(ctx.locker.disabled()),
      ctx.metrics.clone(),
    ));
    BatchBuilder::new(ctx.store.clone(), updater, ctx.settings.clone())
  }

  /// Test: every stored record is visited across scan pages and counted by
  /// outcome; the shards are committed once at the end.
  #[tokio::test]
  async fn test_batch_build_indexes_every_record() {
    let ctx = PipelineTestContext::new().await;
    for i in 0..11 {
      ctx.put_book(&format!("b{:02}", i), "Dune").await;
    }
    ctx.put_album("a1").await;
    ctx
      .store
      .create_or_update(
        Record::new(RecordId::new("x1"), QName::new("org.books", "Book")).with_field("title", json!({"nested": 1})),
      )
      .await
      .unwrap();

    let report = builder(&ctx).run().await.unwrap();

    assert_eq!(
      report,
      BatchReport {
        submitted: 13,
        indexed: 11,
        skipped: 1,
        deleted: 0,
        failed: 1,
        retried: 0,
      }
    );
    assert_eq!(ctx.shard.len(), 11);
    assert!(ctx.shard.contains("b07-last"));
    assert_eq!(ctx.shard.commit_count(), 1);
  }

  /// Test: an unreachable shard shows up as retried records and a failed commit.
  #[tokio::test]
  async fn test_batch_build_with_shard_down() {
    let ctx = PipelineTestContext::new().await;
    ctx.put_book("b1", "Dune").await;
    ctx.shard.set_reachable(false);

    let err = builder(&ctx).run().await.unwrap_err();

    assert!(matches!(err, BatchError::Commit(_)));
    assert_eq!(ctx.metrics.get(crate::indexer::Counter::Retries), 1);
    assert!(ctx.shard.is_empty());
  }

  /// Test: an empty store finishes immediately with nothing submitted.
  #[tokio::test]
  async fn test_batch_build_on_empty_store() {
    let ctx = PipelineTestContext::new().await;
    let report = builder(&ctx).run().await.unwrap();
    assert_eq!(report, BatchReport::default());
    assert_eq!(ctx.shard.commit_count(), 1);
  }

  /// Store whose reads never finish in time.
  struct StalledReads {
    inner: Arc<MemoryRecordStore>,
  }

  #[async_trait]
  impl RecordStore for StalledReads {
    async fn read(&self, id: &RecordId, version: Option<u64>) -> Result<Record> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      self.inner.read(id, version).await
    }

    async fn create_or_update(&self, record: Record) -> Result<Record> {
      self.inner.create_or_update(record).await
    }

    async fn delete(&self, id: &RecordId) -> Result<()> {
      self.inner.delete(id).await
    }

    async fn scan(&self, after: Option<&RecordId>, limit: usize) -> Result<Vec<RecordId>> {
      self.inner.scan(after, limit).await
    }
  }

  /// Test: a build that cannot finish within its timeout reports the records
  /// still outstanding and commits nothing.
  #[tokio::test]
  async fn test_batch_build_times_out() {
    let ctx = PipelineTestContext::new().await;
    ctx.put_book("b1", "Dune").await;

    let indexer = Arc::new(Indexer::new(
      Arc::new(StalledReads {
        inner: ctx.store.clone(),
      }),
      ctx.generations.clone(),
      ctx.updater.indexer().shards().clone(),
    ));
    let updater = Arc::new(IndexUpdater::new(
      indexer,
      Arc::new(ctx.locker.disabled()),
      ctx.metrics.clone(),
    ));
    let mut settings = ctx.settings.clone();
    settings.batch_build_timeout_secs = 1;

    let err = BatchBuilder::new(ctx.store.clone(), updater, settings).run().await.unwrap_err();

    assert!(matches!(err, BatchError::Timeout { remaining: 1 }));
    assert_eq!(ctx.shard.commit_count(), 0);
  }
}
