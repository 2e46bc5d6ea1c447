//! Per-message indexing state machine.
//!
//! ```text
//! RECEIVED → LOCKED → MATCHED | SKIPPED → SHIPPED | FAILED → DONE
//! ```
//!
//! Transient failures (lock timeout, unreachable store or shard) leave the
//! message pending for redelivery. Terminal failures, panics included, are
//! counted and the message is acknowledged so it cannot block the
//! subscription.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use super::{MessageConsumer, ProcessResult, pool::panic_message};
use crate::{
  domain::record::RecordId,
  indexer::{Counter, IndexOutcome, Indexer, IndexerMetrics},
  lock::{LockError, RecordLocker},
  rowlog::RowLogMessage,
};

/// Result of indexing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Indexed,
  Skipped,
  Deleted,
  /// Terminal failure, counted
  Failed,
  /// Transient failure, try again later
  Retry,
}

impl UpdateOutcome {
  pub fn to_process_result(self) -> ProcessResult {
    match self {
      Self::Retry => ProcessResult::Retry,
      _ => ProcessResult::Done,
    }
  }
}

pub struct IndexUpdater {
  indexer: Arc<Indexer>,
  locker: Arc<RecordLocker>,
  metrics: Arc<IndexerMetrics>,
}

impl IndexUpdater {
  pub fn new(indexer: Arc<Indexer>, locker: Arc<RecordLocker>, metrics: Arc<IndexerMetrics>) -> Self {
    Self {
      indexer,
      locker,
      metrics,
    }
  }

  pub fn metrics(&self) -> &Arc<IndexerMetrics> {
    &self.metrics
  }

  pub fn indexer(&self) -> &Arc<Indexer> {
    &self.indexer
  }

  /// Lock, index and unlock one record.
  pub async fn update(&self, record_id: &RecordId) -> UpdateOutcome {
    trace!(record_id = %record_id, state = "received");

    let token = match self.locker.lock(record_id).await {
      Ok(token) => token,
      Err(e @ LockError::Timeout { .. }) => {
        debug!(record_id = %record_id, error = %e, "Lock timeout, will retry");
        self.metrics.increment(Counter::LockTimeouts);
        self.metrics.increment(Counter::Retries);
        return UpdateOutcome::Retry;
      }
      Err(e) => {
        warn!(record_id = %record_id, error = %e, "Could not lock record, will retry");
        self.metrics.increment(Counter::Retries);
        return UpdateOutcome::Retry;
      }
    };
    trace!(record_id = %record_id, state = "locked");

    let result = AssertUnwindSafe(self.indexer.index(record_id)).catch_unwind().await;
    let outcome = match result {
      Ok(Ok(IndexOutcome::Skipped)) => {
        trace!(record_id = %record_id, state = "skipped");
        self.metrics.increment(Counter::Skipped);
        UpdateOutcome::Skipped
      }
      Ok(Ok(IndexOutcome::Indexed { .. })) => {
        trace!(record_id = %record_id, state = "shipped");
        self.metrics.increment(Counter::Processed);
        UpdateOutcome::Indexed
      }
      Ok(Ok(IndexOutcome::Deleted { .. })) => {
        trace!(record_id = %record_id, state = "shipped");
        self.metrics.increment(Counter::Deleted);
        UpdateOutcome::Deleted
      }
      Ok(Err(e)) if e.is_transient() => {
        warn!(record_id = %record_id, error = %e, "Indexing failed, will retry");
        self.metrics.increment(Counter::Retries);
        UpdateOutcome::Retry
      }
      Ok(Err(e)) => {
        error!(record_id = %record_id, error = %e, state = "failed", "Indexing failed");
        self.metrics.increment(Counter::Failed);
        UpdateOutcome::Failed
      }
      Err(panic) => {
        error!(record_id = %record_id, panic = %panic_message(panic.as_ref()), state = "failed", "Indexing panicked");
        self.metrics.increment(Counter::Exceptions);
        self.metrics.increment(Counter::Failed);
        UpdateOutcome::Failed
      }
    };

    self.locker.unlock_log_failure(&token).await;
    trace!(record_id = %record_id, state = "done", ?outcome);
    outcome
  }
}

#[async_trait]
impl MessageConsumer for IndexUpdater {
  async fn process(&self, message: Arc<RowLogMessage>) -> ProcessResult {
    match RecordId::from_row_key(message.row_key()) {
      Ok(record_id) => self.update(&record_id).await.to_process_result(),
      Err(e) => {
        error!(message = %message.id(), error = %e, "Message row key is not a record id");
        self.metrics.increment(Counter::Failed);
        ProcessResult::Done
      }
    }
  }
}
