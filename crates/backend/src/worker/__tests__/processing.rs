//! Subscription processor E2E tests.
//!
//! Records are written through the store, which appends to the row log; the
//! processor pulls the messages and indexes the records into the memory shard.

#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeMap,
    sync::{
      Arc, Mutex,
      atomic::{AtomicBool, Ordering},
    },
    time::Duration,
  };

  use async_trait::async_trait;
  use dashmap::DashSet;
  use serde_json::json;
  use tokio::sync::Notify;

  use crate::{
    conf::{IndexerConf, ShardMap},
    domain::record::{QName, Record, RecordId},
    indexer::Counter,
    lock::RecordLocker,
    repository::RecordStore,
    rowlog::{MessageId, RowLogMessage, Subscription},
    worker::{
      MessageConsumer, PoolError, ProcessResult,
      __tests__::helpers::{INDEXER, PipelineTestContext, WAIT, wait_until},
    },
  };

  /// Test: a stored record ends up in the shard and its message is removed.
  #[tokio::test]
  async fn test_stored_record_is_indexed() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx.put_book("b1", "Dune").await;

    assert!(wait_until(WAIT, || ctx.shard.contains("b1-last")).await);
    assert_eq!(ctx.shard.get("b1-last").unwrap().value("title"), Some("Dune"));
    assert!(ctx.wait_for_empty_log().await);
    assert_eq!(ctx.metrics.get(Counter::Processed), 1);

    handle.stop(Duration::from_secs(1)).await.unwrap();
    assert!(ctx.locker.is_healthy());
  }

  /// Test: an update overwrites the document, a delete removes it.
  #[tokio::test]
  async fn test_update_and_delete_follow_the_record() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx.put_book("b1", "Dune").await;
    assert!(wait_until(WAIT, || ctx.metrics.get(Counter::Processed) >= 1).await);

    ctx.put_book("b1", "Dune Messiah").await;
    assert!(
      wait_until(WAIT, || {
        ctx.shard.get("b1-last").and_then(|doc| doc.value("title").map(str::to_string)) == Some("Dune Messiah".into())
      })
      .await
    );

    ctx.store.delete(&RecordId::new("b1")).await.unwrap();
    assert!(wait_until(WAIT, || ctx.shard.is_empty()).await);
    assert!(ctx.wait_for_empty_log().await);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: a record no rule matches is acknowledged without touching the shard.
  #[tokio::test]
  async fn test_unmatched_record_is_skipped() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx.put_album("a1").await;

    assert!(wait_until(WAIT, || ctx.metrics.get(Counter::Skipped) == 1).await);
    assert!(ctx.wait_for_empty_log().await);
    assert_eq!(ctx.shard.write_count(), 0);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: while the shard is down the message stays pending and is retried;
  /// once it is back the record gets indexed.
  #[tokio::test]
  async fn test_shard_outage_leaves_message_pending() {
    let ctx = PipelineTestContext::new().await;
    ctx.shard.set_reachable(false);
    let handle = ctx.indexer_processor().spawn();

    ctx.put_book("b1", "Dune").await;

    assert!(wait_until(WAIT, || ctx.metrics.get(Counter::Retries) >= 2).await);
    assert_eq!(ctx.table.row_count().await, 1);
    assert_eq!(ctx.metrics.get(Counter::Failed), 0);

    let pending = ctx.rowlog.next(INDEXER, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let state = ctx.rowlog.state(pending[0].id()).await.unwrap().unwrap();
    assert!(state[INDEXER].try_count >= 1);
    assert!(!state[INDEXER].is_done());

    ctx.shard.set_reachable(true);
    assert!(wait_until(WAIT, || ctx.shard.contains("b1-last")).await);
    assert!(ctx.wait_for_empty_log().await);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: an unindexable record is counted as failed and acknowledged so it
  /// cannot block the subscription.
  #[tokio::test]
  async fn test_unindexable_record_is_acknowledged() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx
      .store
      .create_or_update(
        Record::new(RecordId::new("b1"), QName::new("org.books", "Book")).with_field("title", json!({"nested": true})),
      )
      .await
      .unwrap();
    ctx.put_book("b2", "Dune").await;

    assert!(wait_until(WAIT, || ctx.metrics.get(Counter::Failed) == 1).await);
    assert!(wait_until(WAIT, || ctx.shard.contains("b2-last")).await);
    assert!(ctx.wait_for_empty_log().await);
    assert!(!ctx.shard.contains("b1-last"));

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: a record locked by someone else times out, stays pending, and is
  /// indexed once the other holder lets go.
  #[tokio::test]
  async fn test_locked_record_is_retried() {
    let ctx = PipelineTestContext::new().await;
    let other = RecordLocker::new(Arc::new(ctx.coordinator.client()), &ctx.lock_config);
    let token = other.lock(&RecordId::new("b1")).await.unwrap();

    let handle = ctx.indexer_processor().spawn();
    ctx.put_book("b1", "Dune").await;

    assert!(wait_until(WAIT, || ctx.metrics.get(Counter::LockTimeouts) >= 1).await);
    assert!(!ctx.shard.contains("b1-last"));
    assert_eq!(ctx.table.row_count().await, 1);

    other.unlock(&token).await.unwrap();
    assert!(wait_until(WAIT, || ctx.shard.contains("b1-last")).await);
    assert!(ctx.wait_for_empty_log().await);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: a record id containing the string-form separators is indexed
  /// like any other.
  #[tokio::test]
  async fn test_record_id_with_separators_is_indexed() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx.put_book("a!b=c", "Dune").await;

    assert!(wait_until(WAIT, || ctx.shard.contains(r"a\!b\=c-last")).await);
    assert!(ctx.wait_for_empty_log().await);
    assert_eq!(ctx.metrics.get(Counter::Failed), 0);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Test: a new configuration generation applies to the next message
  /// without restarting the processor.
  #[tokio::test]
  async fn test_reloaded_rules_apply_to_next_message() {
    let ctx = PipelineTestContext::new().await;
    let handle = ctx.indexer_processor().spawn();

    ctx.put_book("b1", "Dune").await;
    assert!(wait_until(WAIT, || ctx.shard.contains("b1-last")).await);

    let music_only = IndexerConf::parse(
      r#"
[[case]]
record_type_namespace = "org.music"
version_tags = ["last"]
"#,
      &ctx.catalog,
    )
    .unwrap();
    let shard_map = ShardMap::new(&BTreeMap::from([("s1".to_string(), "mem://s1".to_string())])).unwrap();
    assert_eq!(ctx.generations.install(music_only, shard_map), 2);

    ctx.put_book("b2", "Emma").await;
    ctx.put_album("a1").await;

    assert!(wait_until(WAIT, || ctx.shard.contains("a1-last")).await);
    assert!(ctx.wait_for_empty_log().await);
    assert!(!ctx.shard.contains("b2-last"));
    assert_eq!(ctx.metrics.get(Counter::Skipped), 1);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  // ==========================================================================
  // Ordering and shutdown
  // ==========================================================================

  /// Records which messages ran and whether two of one row ever overlapped.
  #[derive(Default)]
  struct OrderRecorder {
    active: DashSet<Vec<u8>>,
    seen: Mutex<Vec<u64>>,
    overlapped: AtomicBool,
  }

  #[async_trait]
  impl MessageConsumer for OrderRecorder {
    async fn process(&self, message: Arc<RowLogMessage>) -> ProcessResult {
      if !self.active.insert(message.row_key().to_vec()) {
        self.overlapped.store(true, Ordering::SeqCst);
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.seen.lock().unwrap().push(message.seq_nr());
      self.active.remove(message.row_key());
      ProcessResult::Done
    }
  }

  /// Test: an order-respecting subscription handles a row's messages one at a
  /// time, in append order, even with several workers.
  #[tokio::test]
  async fn test_respect_order_processes_row_sequentially() {
    let ctx = PipelineTestContext::with_subscription(
      Subscription::local("ordered")
        .respecting_order(true)
        .with_wakeup_timeout(Duration::from_millis(50)),
    )
    .await;
    for _ in 0..3 {
      ctx.rowlog.append(b"row1", None).await.unwrap();
    }

    let recorder = Arc::new(OrderRecorder::default());
    let handle = ctx.processor("ordered", recorder.clone()).spawn();

    assert!(wait_until(WAIT, || recorder.seen.lock().unwrap().len() == 3).await);
    assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2]);
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    assert!(ctx.wait_for_empty_log().await);

    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  /// Asks for a retry every time and remembers what it saw.
  #[derive(Default)]
  struct Refuser {
    seen: Mutex<Option<MessageId>>,
  }

  #[async_trait]
  impl MessageConsumer for Refuser {
    async fn process(&self, message: Arc<RowLogMessage>) -> ProcessResult {
      *self.seen.lock().unwrap() = Some(message.id().clone());
      ProcessResult::Retry
    }
  }

  /// Test: a cooling message finished elsewhere is forgotten by the processor.
  #[tokio::test]
  async fn test_cooling_message_finished_elsewhere_is_forgotten() {
    let ctx = PipelineTestContext::new().await;
    let refuser = Arc::new(Refuser::default());
    let handle = ctx.processor(INDEXER, refuser.clone()).spawn();

    ctx.rowlog.append(b"row1", None).await.unwrap();
    assert!(wait_until(WAIT, || handle.cooling_count() == 1).await);

    let id = refuser.seen.lock().unwrap().clone().unwrap();
    assert!(ctx.rowlog.mark_done(&id, INDEXER).await.unwrap());

    assert!(wait_until(WAIT, || handle.cooling_count() == 0).await);
    handle.stop(Duration::from_secs(1)).await.unwrap();
  }

  struct Stuck {
    started: Notify,
  }

  #[async_trait]
  impl MessageConsumer for Stuck {
    async fn process(&self, _message: Arc<RowLogMessage>) -> ProcessResult {
      self.started.notify_one();
      tokio::time::sleep(Duration::from_secs(60)).await;
      ProcessResult::Done
    }
  }

  /// Test: stopping with work still running past the grace period reports it,
  /// and the message stays pending for the next run.
  #[tokio::test]
  async fn test_stop_reports_unfinished_work() {
    let ctx = PipelineTestContext::new().await;
    let stuck = Arc::new(Stuck { started: Notify::new() });
    let handle = ctx.processor(INDEXER, stuck.clone()).spawn();

    ctx.rowlog.append(b"row1", None).await.unwrap();
    tokio::time::timeout(WAIT, stuck.started.notified()).await.unwrap();

    let err = handle.stop(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err, PoolError::Incomplete { remaining: 1 });
    assert_eq!(ctx.table.row_count().await, 1);
  }
}
