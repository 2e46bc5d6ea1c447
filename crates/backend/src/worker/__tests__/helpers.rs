//! Test helpers for pipeline integration tests.
//!
//! Provides `PipelineTestContext`, which wires the in-memory coordinator, row
//! log, record store and search shard together the way a running indexer
//! process does.

use std::{
  collections::BTreeMap,
  sync::Arc,
  time::{Duration, Instant},
};

use serde_json::json;

use crate::{
  conf::{GenerationHandle, IndexerConf, ShardMap},
  coordinator::MemoryCoordinator,
  domain::{
    config::{IndexerSettings, LockConfig, RowLogConfig},
    record::{QName, Record, RecordId},
  },
  indexer::{Indexer, IndexerMetrics},
  lock::RecordLocker,
  repository::{MemoryRecordStore, MemoryTypeCatalog, RecordStore},
  rowlog::{MemoryLogTable, RowLog, Subscription, SubscriptionRegistry},
  search::{MemorySearchShard, SearchShard, ShardManager},
  worker::{IndexUpdater, MessageConsumer, SubscriptionProcessor},
};

pub const INDEXER: &str = "indexer";

pub const BOOKS_CONF: &str = r#"
[[case]]
record_type_namespace = "org.books"
record_type_name = "Book"
variant = ["*"]
version_tags = ["last"]

[[field]]
name = "title"
"#;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct PipelineTestContext {
  pub coordinator: MemoryCoordinator,
  pub table: Arc<MemoryLogTable>,
  pub registry: Arc<SubscriptionRegistry>,
  pub rowlog: Arc<RowLog>,
  pub store: Arc<MemoryRecordStore>,
  pub catalog: MemoryTypeCatalog,
  pub generations: Arc<GenerationHandle>,
  pub shard: Arc<MemorySearchShard>,
  pub lock_config: LockConfig,
  pub locker: Arc<RecordLocker>,
  pub metrics: Arc<IndexerMetrics>,
  pub updater: Arc<IndexUpdater>,
  pub settings: IndexerSettings,
}

impl PipelineTestContext {
  /// Context with one local `indexer` subscription polling every 50ms.
  pub async fn new() -> Self {
    Self::with_subscription(Subscription::local(INDEXER).with_wakeup_timeout(Duration::from_millis(50))).await
  }

  pub async fn with_subscription(subscription: Subscription) -> Self {
    let coordinator = MemoryCoordinator::new();
    let rowlog_config = RowLogConfig {
      notify_delay_ms: 10,
      ..RowLogConfig::default()
    };

    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(coordinator.clone()), &rowlog_config));
    registry.add(&subscription).await.expect("register subscription");

    let table = Arc::new(MemoryLogTable::new());
    let rowlog = Arc::new(RowLog::new(rowlog_config, table.clone(), registry.clone()));
    let store = Arc::new(MemoryRecordStore::with_rowlog(rowlog.clone()));

    let catalog = MemoryTypeCatalog::new(["live"]);
    let conf = IndexerConf::parse(BOOKS_CONF, &catalog).expect("parse index rules");
    let shard_map = ShardMap::new(&BTreeMap::from([("s1".to_string(), "mem://s1".to_string())])).expect("shard map");
    let generations = Arc::new(GenerationHandle::new(conf, shard_map));

    let shard = Arc::new(MemorySearchShard::new("s1"));
    let shards = Arc::new(ShardManager::new([shard.clone() as Arc<dyn SearchShard>]));

    let lock_config = LockConfig {
      timeout_ms: 200,
      ..LockConfig::default()
    };
    let locker = Arc::new(RecordLocker::new(Arc::new(coordinator.client()), &lock_config));
    let metrics = Arc::new(IndexerMetrics::new("books"));
    let indexer = Arc::new(Indexer::new(store.clone(), generations.clone(), shards));
    let updater = Arc::new(IndexUpdater::new(indexer, locker.clone(), metrics.clone()));

    let settings = IndexerSettings {
      name: "books".to_string(),
      workers: 2,
      queue_capacity: 8,
      batch_size: 10,
      shutdown_grace_secs: 2,
      batch_build_timeout_secs: 5,
      ..IndexerSettings::default()
    };

    Self {
      coordinator,
      table,
      registry,
      rowlog,
      store,
      catalog,
      generations,
      shard,
      lock_config,
      locker,
      metrics,
      updater,
      settings,
    }
  }

  /// Processor for `subscription_id` using `consumer`.
  pub fn processor(&self, subscription_id: &str, consumer: Arc<dyn MessageConsumer>) -> SubscriptionProcessor {
    SubscriptionProcessor::new(subscription_id, self.rowlog.clone(), consumer, &self.settings)
  }

  /// Processor for the `indexer` subscription driving the real updater.
  pub fn indexer_processor(&self) -> SubscriptionProcessor {
    self.processor(INDEXER, self.updater.clone())
  }

  pub async fn put_book(&self, id: &str, title: &str) -> Record {
    self
      .store
      .create_or_update(
        Record::new(RecordId::new(id), QName::new("org.books", "Book")).with_field("title", json!(title)),
      )
      .await
      .expect("store book")
  }

  pub async fn put_album(&self, id: &str) -> Record {
    self
      .store
      .create_or_update(Record::new(RecordId::new(id), QName::new("org.music", "Album")))
      .await
      .expect("store album")
  }

  /// Wait until every message has been processed by every subscription.
  pub async fn wait_for_empty_log(&self) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
      if self.table.row_count().await == 0 {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if check() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}
