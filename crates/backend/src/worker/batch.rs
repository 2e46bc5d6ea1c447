//! Batch build: index every record in the store without going through the
//! row log, e.g. after an index rule change or for a new index.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{info, warn};

use super::{IndexUpdater, PoolError, UpdateOutcome, WorkerPool};
use crate::{
  domain::{config::IndexerSettings, record::RecordId},
  repository::{RecordStore, RepositoryError},
  search::ShardError,
};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
  #[error("Failed to scan records: {0}")]
  Repository(#[from] RepositoryError),
  #[error("Worker pool error: {0}")]
  Pool(#[from] PoolError),
  #[error("Batch build did not finish in time, {remaining} records outstanding")]
  Timeout { remaining: usize },
  #[error("Failed to commit shards: {0}")]
  Commit(#[from] ShardError),
}

/// Per-outcome record counts of one batch build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
  pub submitted: usize,
  pub indexed: usize,
  pub skipped: usize,
  pub deleted: usize,
  pub failed: usize,
  /// Transient failures; a batch build does not retry them
  pub retried: usize,
}

#[derive(Default)]
struct Counts {
  indexed: AtomicUsize,
  skipped: AtomicUsize,
  deleted: AtomicUsize,
  failed: AtomicUsize,
  retried: AtomicUsize,
}

impl Counts {
  fn record(&self, outcome: UpdateOutcome) {
    let counter = match outcome {
      UpdateOutcome::Indexed => &self.indexed,
      UpdateOutcome::Skipped => &self.skipped,
      UpdateOutcome::Deleted => &self.deleted,
      UpdateOutcome::Failed => &self.failed,
      UpdateOutcome::Retry => &self.retried,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn report(&self, submitted: usize) -> BatchReport {
    BatchReport {
      submitted,
      indexed: self.indexed.load(Ordering::Relaxed),
      skipped: self.skipped.load(Ordering::Relaxed),
      deleted: self.deleted.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      retried: self.retried.load(Ordering::Relaxed),
    }
  }
}

pub struct BatchBuilder {
  store: Arc<dyn RecordStore>,
  updater: Arc<IndexUpdater>,
  settings: IndexerSettings,
}

impl BatchBuilder {
  /// The updater decides about locking; pass one with a disabled locker when
  /// nothing else writes to the index during the build.
  pub fn new(store: Arc<dyn RecordStore>, updater: Arc<IndexUpdater>, settings: IndexerSettings) -> Self {
    Self {
      store,
      updater,
      settings,
    }
  }

  pub async fn run(&self) -> Result<BatchReport, BatchError> {
    let started = Instant::now();
    let pool = WorkerPool::new(
      format!("batch:{}", self.settings.name),
      self.settings.worker_count(),
      self.settings.queue_capacity,
    );
    let counts = Arc::new(Counts::default());
    let page_size = self.settings.batch_size.max(1);

    let mut submitted = 0;
    let mut after: Option<RecordId> = None;
    loop {
      let ids = self.store.scan(after.as_ref(), page_size).await?;
      let exhausted = ids.len() < page_size;

      for record_id in ids {
        after = Some(record_id.clone());
        let updater = Arc::clone(&self.updater);
        let counts = Arc::clone(&counts);
        pool
          .submit(Box::pin(async move {
            counts.record(updater.update(&record_id).await);
          }))
          .await?;
        submitted += 1;
      }

      if exhausted {
        break;
      }
    }

    if !pool.wait_idle(self.settings.batch_build_timeout()).await {
      let remaining = pool.outstanding();
      if let Err(e) = pool.shutdown(Duration::ZERO).await {
        warn!(index = %self.settings.name, error = %e, "Abandoned unfinished batch work");
      }
      warn!(index = %self.settings.name, remaining, "Batch build timed out");
      return Err(BatchError::Timeout { remaining });
    }
    pool.shutdown(self.settings.shutdown_grace()).await?;
    self.updater.indexer().shards().commit_all().await?;

    let report = counts.report(submitted);
    info!(
      index = %self.settings.name,
      submitted = report.submitted,
      indexed = report.indexed,
      skipped = report.skipped,
      failed = report.failed,
      retried = report.retried,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "Batch build finished"
    );
    Ok(report)
  }
}
