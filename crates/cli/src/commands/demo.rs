//! In-memory pipeline run: writes generated records through a store that
//! appends to the row log, lets a processor host index them, then rebuilds
//! the same index with a batch build.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rowdex::{
  conf::{GenerationHandle, IndexerConf, ShardMap},
  config::Config,
  coordinator::MemoryCoordinator,
  indexer::{Indexer, IndexerMetrics},
  lock::RecordLocker,
  record::{QName, Record, RecordId},
  repository::{MemoryRecordStore, MemoryTypeCatalog, RecordStore},
  rowlog::{MemoryLogTable, RowLog, Subscription, SubscriptionRegistry},
  search::{MemorySearchShard, SearchShard, ShardManager},
  worker::{BatchBuilder, IndexUpdater, ProcessorHost},
};
use serde_json::json;
use tracing::{info, warn};

/// Used when the configuration names no index rule document.
const DEMO_RULES: &str = r#"
[[case]]
record_type_namespace = "org.books"
record_type_name = "Book"
variant = ["*"]
version_tags = ["last"]

[[field]]
name = "title"

[[field]]
name = "year"
"#;

fn sample_record(i: usize) -> Record {
  let mut id = RecordId::new(format!("rec-{:05}", i));
  if i % 10 == 0 {
    id = id.with_variant("lang", "nl");
  }

  if i % 7 == 0 {
    return Record::new(id, QName::new("org.music", "Album")).with_field("title", json!(format!("Album {}", i)));
  }

  let record = Record::new(id, QName::new("org.books", "Book")).with_field("year", json!(1900 + i % 120));
  if i % 50 == 49 {
    // Nested objects cannot be indexed
    record.with_field("title", json!({ "draft": format!("Book {}", i) }))
  } else {
    record.with_field("title", json!(format!("Book {}", i)))
  }
}

pub async fn cmd_demo(config: &Config, catalog: &MemoryTypeCatalog, records: usize, json_output: bool) -> Result<()> {
  let mut settings = config.indexer.clone();
  if settings.shards.is_empty() {
    for name in ["demo-1", "demo-2"] {
      settings.shards.insert(name.to_string(), format!("mem://{}", name));
    }
  }

  let generations = Arc::new(if settings.indexer_conf.is_some() {
    GenerationHandle::load(&settings, catalog).context("Indexer configuration rejected")?
  } else {
    GenerationHandle::new(
      IndexerConf::parse(DEMO_RULES, catalog)?,
      ShardMap::load(&settings.shards, settings.sharding_conf.as_deref())?,
    )
  });

  let memory_shards: Vec<Arc<MemorySearchShard>> = generations
    .current()
    .shard_map
    .shard_names()
    .iter()
    .map(|name| Arc::new(MemorySearchShard::new(name.clone())))
    .collect();
  let shards = Arc::new(ShardManager::new(
    memory_shards.iter().map(|shard| Arc::clone(shard) as Arc<dyn SearchShard>),
  ));

  let coordinator = MemoryCoordinator::new();
  let registry = Arc::new(SubscriptionRegistry::new(Arc::new(coordinator.clone()), &config.rowlog));
  registry
    .add(&Subscription::local(&settings.subscription_id).with_wakeup_timeout(Duration::from_millis(200)))
    .await?;
  let table = Arc::new(MemoryLogTable::new());
  let rowlog = Arc::new(RowLog::new(config.rowlog.clone(), table.clone(), registry));
  let store = Arc::new(MemoryRecordStore::with_rowlog(rowlog.clone()));

  let locker = Arc::new(RecordLocker::new(Arc::new(coordinator.client()), &config.lock));
  let metrics = Arc::new(IndexerMetrics::new(&settings.name));
  let indexer = Arc::new(Indexer::new(store.clone(), generations, shards.clone()));
  let updater = Arc::new(IndexUpdater::new(indexer.clone(), locker.clone(), metrics.clone()));

  let host = ProcessorHost::new(rowlog.clone(), settings.clone())
    .with_consumer(&settings.subscription_id, updater)
    .spawn();

  let started = Instant::now();
  for i in 0..records {
    store.create_or_update(sample_record(i)).await?;
  }
  info!(records, "Records written");

  let deadline = Instant::now() + settings.batch_build_timeout();
  let mut pending = table.row_count().await;
  while pending > 0 {
    if Instant::now() >= deadline {
      warn!(pending, "Gave up waiting for the row log to drain");
      break;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    pending = table.row_count().await;
  }
  let drained_in = started.elapsed();

  host.shutdown().await?;
  shards.commit_all().await?;
  let pipeline = metrics.snapshot();

  let batch_updater = Arc::new(IndexUpdater::new(
    indexer,
    Arc::new(locker.disabled()),
    Arc::new(IndexerMetrics::new(format!("{}-batch", settings.name))),
  ));
  let batch = BatchBuilder::new(store, batch_updater, settings.clone()).run().await?;

  let documents: serde_json::Map<String, serde_json::Value> = memory_shards
    .iter()
    .map(|shard| (shard.name().to_string(), json!(shard.len())))
    .collect();

  if json_output {
    let report = json!({
      "records": records,
      "pending": pending,
      "elapsed_ms": drained_in.as_millis() as u64,
      "pipeline": pipeline,
      "batch": batch,
      "documents": documents,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    return Ok(());
  }

  println!("rowdex demo");
  println!("===========\n");
  println!("Records:        {}", records);
  println!("Drained in:     {} ms ({} pending)", drained_in.as_millis(), pending);
  println!("\n--- Row log pipeline ---");
  println!("Processed:      {}", pipeline.processed);
  println!("Skipped:        {}", pipeline.skipped);
  println!("Failed:         {}", pipeline.failed);
  println!("Retries:        {}", pipeline.retries);
  println!("Lock timeouts:  {}", pipeline.lock_timeouts);
  println!("\n--- Batch build ---");
  println!("Submitted:      {}", batch.submitted);
  println!("Indexed:        {}", batch.indexed);
  println!("Skipped:        {}", batch.skipped);
  println!("Failed:         {}", batch.failed);
  println!("\n--- Documents ---");
  for (shard, count) in &documents {
    println!("  {}: {}", shard, count);
  }
  Ok(())
}
