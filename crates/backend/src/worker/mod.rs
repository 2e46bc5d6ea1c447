//! Message consumption: pulling row log batches and indexing them.
//!
//! # Components
//!
//! - [`WorkerPool`]: bounded pool with caller-runs admission
//! - [`IndexUpdater`]: per-message indexing state machine (lock, match, ship, unlock)
//! - [`SubscriptionProcessor`]: pulls one subscription's batches and feeds the pool
//! - [`ProcessorHost`]: keeps one processor running per subscription this process serves
//! - [`RemoteConsumer`]: hands messages of remote subscriptions to registered listeners
//! - [`BatchBuilder`]: reindexes every record without going through the row log
//!
//! ```text
//! RowLog.next → SubscriptionProcessor → WorkerPool → MessageConsumer → RowLog.mark_done
//!                      ↑ wakeups                          │ Retry
//!                      └──────────────────────────────────┘ (left pending)
//! ```

mod batch;
mod host;
mod pool;
mod processor;
mod remote;
mod updater;

#[cfg(test)]
mod __tests__;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::{
  batch::{BatchBuilder, BatchError, BatchReport},
  host::{HostHandle, ProcessorHost},
  pool::{Admission, PoolError, Task, WorkerPool, panic_message},
  processor::{ProcessorHandle, SubscriptionProcessor},
  remote::{ListenerTransport, RemoteConsumer, TransportError},
  updater::{IndexUpdater, UpdateOutcome},
};
use crate::rowlog::RowLogMessage;

/// What to do with a message after a consumer looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
  /// Acknowledge: mark done for the subscription
  Done,
  /// Leave pending; it is delivered again later
  Retry,
}

/// Handles messages of one subscription.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
  async fn process(&self, message: Arc<RowLogMessage>) -> ProcessResult;
}
