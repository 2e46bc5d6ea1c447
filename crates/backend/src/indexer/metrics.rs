use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

/// Receives every counter increment, e.g. to forward to a metrics system.
pub trait MetricsSink: Send + Sync {
  fn increment(&self, index: &str, counter: Counter, by: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
  /// Documents written for a matched record
  Processed,
  /// No case matched
  Skipped,
  /// Record gone, its documents deleted
  Deleted,
  /// Terminal failure, message acknowledged anyway
  Failed,
  /// Panic while processing
  Exceptions,
  LockTimeouts,
  /// Transient failure, message left pending
  Retries,
}

impl Counter {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Processed => "processed",
      Self::Skipped => "skipped",
      Self::Deleted => "deleted",
      Self::Failed => "failed",
      Self::Exceptions => "exceptions",
      Self::LockTimeouts => "lock_timeouts",
      Self::Retries => "retries",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub processed: u64,
  pub skipped: u64,
  pub deleted: u64,
  pub failed: u64,
  pub exceptions: u64,
  pub lock_timeouts: u64,
  pub retries: u64,
}

/// Per-index outcome counters. Not part of correctness.
#[derive(Default)]
pub struct IndexerMetrics {
  index: String,
  processed: AtomicU64,
  skipped: AtomicU64,
  deleted: AtomicU64,
  failed: AtomicU64,
  exceptions: AtomicU64,
  lock_timeouts: AtomicU64,
  retries: AtomicU64,
  sink: Option<Arc<dyn MetricsSink>>,
}

impl IndexerMetrics {
  pub fn new(index: impl Into<String>) -> Self {
    Self {
      index: index.into(),
      ..Self::default()
    }
  }

  pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
    self.sink = Some(sink);
    self
  }

  fn counter(&self, counter: Counter) -> &AtomicU64 {
    match counter {
      Counter::Processed => &self.processed,
      Counter::Skipped => &self.skipped,
      Counter::Deleted => &self.deleted,
      Counter::Failed => &self.failed,
      Counter::Exceptions => &self.exceptions,
      Counter::LockTimeouts => &self.lock_timeouts,
      Counter::Retries => &self.retries,
    }
  }

  pub fn increment(&self, counter: Counter) {
    self.counter(counter).fetch_add(1, Ordering::Relaxed);
    if let Some(sink) = &self.sink {
      sink.increment(&self.index, counter, 1);
    }
  }

  pub fn get(&self, counter: Counter) -> u64 {
    self.counter(counter).load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      processed: self.get(Counter::Processed),
      skipped: self.get(Counter::Skipped),
      deleted: self.get(Counter::Deleted),
      failed: self.get(Counter::Failed),
      exceptions: self.get(Counter::Exceptions),
      lock_timeouts: self.get(Counter::LockTimeouts),
      retries: self.get(Counter::Retries),
    }
  }
}
