//! One subscription's pull loop.
//!
//! The processor asks the row log for pending messages, hands each to the
//! worker pool and acknowledges or records a failure when the consumer is
//! done with it. It holds no durable state: a message is in flight only
//! between submission and acknowledgement, and the row log stays the single
//! source of truth for pending work.

use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{MessageConsumer, PoolError, ProcessResult, Task, WorkerPool, pool::panic_message};
use crate::{
  domain::config::IndexerSettings,
  rowlog::{MessageId, RowLog, RowLogError, RowLogMessage, Subscription},
};

/// Bookkeeping shared between the pull loop and the tasks it submits.
#[derive(Default)]
struct InFlight {
  messages: DashSet<MessageId>,
  /// Messages that asked for a retry, not handed out again before the instant
  cooling: DashMap<MessageId, Instant>,
  task_done: Notify,
}

impl InFlight {
  fn is_cooling(&self, id: &MessageId, now: Instant) -> bool {
    let until = self.cooling.get(id).map(|entry| *entry);
    match until {
      Some(until) if until > now => true,
      Some(_) => {
        self.cooling.remove(id);
        false
      }
      None => false,
    }
  }

  /// Forget cooling messages the log no longer hands out, e.g. finished by
  /// another processor or purged. `fetched` is one `next` result in id order;
  /// anything before its last id, or anything at all when it came back short,
  /// would have been in it if still pending.
  fn prune_cooling(&self, fetched: &[Arc<RowLogMessage>], complete: bool) {
    let returned: HashSet<&MessageId> = fetched.iter().map(|m| m.id()).collect();
    let last = fetched.last().map(|m| m.id());
    self.cooling.retain(|id, _| {
      let covered = complete || last.is_some_and(|last| id < last);
      !covered || returned.contains(id)
    });
  }
}

pub struct SubscriptionProcessor {
  subscription_id: String,
  rowlog: Arc<RowLog>,
  consumer: Arc<dyn MessageConsumer>,
  pool: Arc<WorkerPool>,
  batch_size: usize,
  in_flight: Arc<InFlight>,
}

impl SubscriptionProcessor {
  pub fn new(
    subscription_id: impl Into<String>,
    rowlog: Arc<RowLog>,
    consumer: Arc<dyn MessageConsumer>,
    settings: &IndexerSettings,
  ) -> Self {
    let subscription_id = subscription_id.into();
    let pool = WorkerPool::new(
      format!("{}:{}", rowlog.id(), subscription_id),
      settings.worker_count(),
      settings.queue_capacity,
    );
    Self {
      subscription_id,
      rowlog,
      consumer,
      pool: Arc::new(pool),
      batch_size: settings.batch_size.max(1),
      in_flight: Arc::new(InFlight::default()),
    }
  }

  /// Start the pull loop.
  pub fn spawn(self) -> ProcessorHandle {
    let cancel = CancellationToken::new();
    let subscription_id = self.subscription_id.clone();
    let pool = Arc::clone(&self.pool);
    let in_flight = Arc::clone(&self.in_flight);
    let loop_cancel = cancel.clone();
    let join = tokio::spawn(async move { self.run(loop_cancel).await });
    ProcessorHandle {
      subscription_id,
      cancel,
      join,
      pool,
      in_flight,
    }
  }

  async fn run(self, cancel: CancellationToken) {
    info!(subscription = %self.subscription_id, log = %self.rowlog.id(), "Processor started");
    let mut wakeups = self.rowlog.wakeups();

    loop {
      if cancel.is_cancelled() {
        break;
      }

      let wakeup_timeout = self.wakeup_timeout().await;
      let submitted = match self.fill(wakeup_timeout).await {
        Ok(submitted) => submitted,
        Err(e) => {
          warn!(subscription = %self.subscription_id, error = %e, "Failed to fetch messages");
          0
        }
      };

      // More may be waiting right behind this batch
      if submitted > 0 {
        continue;
      }

      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = wakeups.changed() => trace!(subscription = %self.subscription_id, "Woken by append"),
        _ = self.in_flight.task_done.notified() => {}
        _ = tokio::time::sleep(wakeup_timeout) => {}
      }
    }

    info!(subscription = %self.subscription_id, "Processor stopped pulling");
  }

  async fn wakeup_timeout(&self) -> Duration {
    match self.rowlog.registry().get(&self.subscription_id).await {
      Ok(Some(subscription)) => subscription.wakeup_timeout(),
      Ok(None) => Subscription::local(&self.subscription_id).wakeup_timeout(),
      Err(e) => {
        debug!(subscription = %self.subscription_id, error = %e, "Could not read subscription");
        Subscription::local(&self.subscription_id).wakeup_timeout()
      }
    }
  }

  /// Submit one batch of pending messages. Returns how many were submitted.
  async fn fill(&self, cooldown: Duration) -> Result<usize, RowLogError> {
    // Ask past messages we are already busy with so they cannot starve the rest
    let limit = self.batch_size + self.in_flight.messages.len() + self.in_flight.cooling.len();
    let messages = self.rowlog.next(&self.subscription_id, limit).await?;
    self.in_flight.prune_cooling(&messages, messages.len() < limit);

    let now = Instant::now();
    let mut submitted = 0;
    for message in messages {
      if submitted >= self.batch_size {
        break;
      }
      let id = message.id().clone();
      if self.in_flight.is_cooling(&id, now) || !self.in_flight.messages.insert(id.clone()) {
        continue;
      }

      match self.pool.submit(self.task(message, cooldown)).await {
        Ok(_) => submitted += 1,
        Err(e) => {
          self.in_flight.messages.remove(&id);
          debug!(subscription = %self.subscription_id, error = %e, "Pool no longer accepts work");
          break;
        }
      }
    }

    if submitted > 0 {
      trace!(subscription = %self.subscription_id, submitted, "Batch submitted");
    }
    Ok(submitted)
  }

  fn task(&self, message: Arc<RowLogMessage>, cooldown: Duration) -> Task {
    let rowlog = Arc::clone(&self.rowlog);
    let consumer = Arc::clone(&self.consumer);
    let in_flight = Arc::clone(&self.in_flight);
    let subscription_id = self.subscription_id.clone();

    Box::pin(async move {
      let id = message.id().clone();
      let result = match AssertUnwindSafe(consumer.process(message)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
          error!(message = %id, subscription = %subscription_id, panic = %panic_message(panic.as_ref()), "Consumer panicked");
          ProcessResult::Done
        }
      };

      match result {
        ProcessResult::Done => match rowlog.mark_done(&id, &subscription_id).await {
          Ok(_) => {
            in_flight.cooling.remove(&id);
          }
          Err(e) => {
            // Still pending; it comes back and is processed again
            warn!(message = %id, subscription = %subscription_id, error = %e, "Failed to mark message done");
            in_flight.cooling.insert(id.clone(), Instant::now() + cooldown);
          }
        },
        ProcessResult::Retry => {
          if let Err(e) = rowlog.record_failure(&id, &subscription_id).await {
            debug!(message = %id, subscription = %subscription_id, error = %e, "Failed to record failure");
          }
          in_flight.cooling.insert(id.clone(), Instant::now() + cooldown);
        }
      }

      in_flight.messages.remove(&id);
      in_flight.task_done.notify_one();
    })
  }
}

/// Running processor.
pub struct ProcessorHandle {
  subscription_id: String,
  cancel: CancellationToken,
  join: JoinHandle<()>,
  pool: Arc<WorkerPool>,
  in_flight: Arc<InFlight>,
}

impl ProcessorHandle {
  pub fn subscription_id(&self) -> &str {
    &self.subscription_id
  }

  /// Messages currently held back after asking for a retry.
  #[cfg(test)]
  pub(crate) fn cooling_count(&self) -> usize {
    self.in_flight.cooling.len()
  }

  /// Stop pulling, then give in-flight messages `grace` to finish.
  pub async fn stop(self, grace: Duration) -> Result<(), PoolError> {
    self.cancel.cancel();
    if let Err(e) = self.join.await {
      warn!(subscription = %self.subscription_id, error = %e, "Processor task failed");
    }
    let result = self.pool.shutdown(grace).await;
    info!(subscription = %self.subscription_id, clean = result.is_ok(), "Processor stopped");
    result
  }
}
