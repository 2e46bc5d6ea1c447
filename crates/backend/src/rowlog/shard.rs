//! Per-subscription delivery view over the log table.
//!
//! A message appended while subscriptions `a` and `b` exist gets one shard
//! entry per subscription. Marking it done for `a` removes only `a`'s entry,
//! so each subscription progresses on its own.

use std::{collections::HashSet, sync::Arc};

use tracing::trace;

use super::{
  message::MessageId,
  subscription::Subscription,
  table::{LogTable, LogTableError},
};

pub struct RowLogShard {
  table: Arc<dyn LogTable>,
  page_size: usize,
}

impl RowLogShard {
  pub fn new(table: Arc<dyn LogTable>, page_size: usize) -> Self {
    Self {
      table,
      page_size: page_size.max(1),
    }
  }

  /// Register a message for each of `subscriptions`.
  pub async fn put_message(&self, id: &MessageId, subscriptions: &[String]) -> Result<(), LogTableError> {
    for subscription in subscriptions {
      self.table.put_shard_entry(subscription, id).await?;
    }
    Ok(())
  }

  pub async fn remove_message(&self, id: &MessageId, subscription: &str) -> Result<(), LogTableError> {
    self.table.remove_shard_entry(subscription, id).await
  }

  /// Up to `limit` ids still owed to `subscription`, oldest first.
  ///
  /// With `respect_order` only the oldest outstanding id of each row is
  /// returned. Ids younger than the subscription's minimal process delay
  /// (relative to `now_ms`) are held back.
  pub async fn next(
    &self,
    subscription: &Subscription,
    limit: usize,
    now_ms: i64,
  ) -> Result<Vec<MessageId>, LogTableError> {
    let mut batch = Vec::new();
    if limit == 0 {
      return Ok(batch);
    }

    let cutoff = (subscription.minimal_process_delay_ms > 0)
      .then(|| now_ms.saturating_sub(subscription.minimal_process_delay_ms as i64));
    let mut seen_rows = HashSet::new();
    let mut after: Option<MessageId> = None;

    loop {
      let page = self
        .table
        .scan_shard(&subscription.id, after.as_ref(), self.page_size)
        .await?;
      let exhausted = page.len() < self.page_size;

      for id in page {
        after = Some(id.clone());

        // Ids are timestamp ordered, nothing later is old enough either
        if cutoff.is_some_and(|cutoff| id.timestamp > cutoff) {
          trace!(subscription = %subscription.id, returned = batch.len(), "Stopped at minimal process delay");
          return Ok(batch);
        }
        if subscription.respect_order && !seen_rows.insert(id.row_key.clone()) {
          continue;
        }

        batch.push(id);
        if batch.len() >= limit {
          return Ok(batch);
        }
      }

      if exhausted {
        return Ok(batch);
      }
    }
  }
}
