//! Row log - durable per-row message queue with independent subscriptions.
//!
//! Every record mutation appends one message keyed by the record's row key.
//! Each subscription registered at append time owes processing for it and
//! progresses on its own; the message is physically removed once every
//! subscription is done with it.
//!
//! ```text
//! append ──► message row (payload + execution state)
//!        └─► shard entry per subscription ──► next(subscription) ──► mark_done
//! ```
//!
//! State flips are conditional writes on the message row: they are either
//! fully applied or not applied at all. Transient storage failures are
//! returned to the caller, which leaves the message pending for redelivery.

mod message;
mod shard;
mod subscription;
mod table;

use std::{
  collections::HashSet,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

pub use self::{
  message::{ExecutionState, MessageId, RowLogMessage, SubscriptionState, SubscriptionStatus},
  shard::RowLogShard,
  subscription::{RegistryChanges, RegistryError, Subscription, SubscriptionKind, SubscriptionRegistry},
  table::{LogTable, LogTableError, MemoryLogTable, MessageRow, VersionedRow},
};
use crate::domain::config::RowLogConfig;

#[derive(Debug, thiserror::Error)]
pub enum RowLogError {
  #[error("Log storage error: {0}")]
  Table(#[from] LogTableError),
  #[error("Subscription registry error: {0}")]
  Registry(#[from] RegistryError),
  #[error("Gave up on {0} after repeated concurrent updates")]
  Contention(String),
  #[error("Message not found: {0}")]
  MessageNotFound(String),
}

impl RowLogError {
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Table(e) => e.is_transient(),
      Self::Registry(e) => e.is_transient(),
      Self::Contention(_) => true,
      Self::MessageNotFound(_) => false,
    }
  }
}

pub type Result<T> = std::result::Result<T, RowLogError>;

/// Timestamp and sequence allocation state of one row.
#[derive(Debug, Clone, Copy)]
struct RowCursor {
  last_timestamp: i64,
  next_seq: u64,
}

// ============================================================================
// Notifier
// ============================================================================

const NEVER: u64 = u64::MAX;

/// Wakes idle processors after appends, at most once per `delay`.
///
/// An append inside the delay window schedules a single trailing wake-up so
/// the last append of a burst is never left unannounced.
struct Notifier {
  enabled: bool,
  delay_ms: u64,
  epoch: Instant,
  last_ms: AtomicU64,
  scheduled: AtomicBool,
  tx: watch::Sender<u64>,
}

impl Notifier {
  fn new(config: &RowLogConfig) -> Self {
    let (tx, _) = watch::channel(0);
    Self {
      enabled: config.notify_enabled,
      delay_ms: config.notify_delay_ms,
      epoch: Instant::now(),
      last_ms: AtomicU64::new(NEVER),
      scheduled: AtomicBool::new(false),
      tx,
    }
  }

  fn now_ms(&self) -> u64 {
    self.epoch.elapsed().as_millis() as u64
  }

  fn notify(self: &Arc<Self>) {
    if !self.enabled {
      return;
    }

    let now = self.now_ms();
    let last = self.last_ms.load(Ordering::SeqCst);
    if last == NEVER || now.saturating_sub(last) >= self.delay_ms {
      self.last_ms.store(now, Ordering::SeqCst);
      self.fire();
      return;
    }

    if self.scheduled.swap(true, Ordering::SeqCst) {
      return;
    }
    let wait = self.delay_ms.saturating_sub(now.saturating_sub(last));
    let notifier = Arc::clone(self);
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(wait)).await;
      notifier.scheduled.store(false, Ordering::SeqCst);
      notifier.last_ms.store(notifier.now_ms(), Ordering::SeqCst);
      notifier.fire();
    });
  }

  fn fire(&self) {
    self.tx.send_modify(|count| *count = count.wrapping_add(1));
  }
}

// ============================================================================
// RowLog
// ============================================================================

pub struct RowLog {
  config: RowLogConfig,
  table: Arc<dyn LogTable>,
  shard: RowLogShard,
  registry: Arc<SubscriptionRegistry>,
  /// Held from id allocation until the message is visible in the shard, so
  /// a row's messages are published in sequence order.
  rows: DashMap<Vec<u8>, Arc<Mutex<RowCursor>>>,
  notifier: Arc<Notifier>,
}

impl RowLog {
  pub fn new(config: RowLogConfig, table: Arc<dyn LogTable>, registry: Arc<SubscriptionRegistry>) -> Self {
    let shard = RowLogShard::new(Arc::clone(&table), config.scan_page_size);
    let notifier = Arc::new(Notifier::new(&config));
    Self {
      config,
      table,
      shard,
      registry,
      rows: DashMap::new(),
      notifier,
    }
  }

  pub fn id(&self) -> &str {
    &self.config.id
  }

  pub fn config(&self) -> &RowLogConfig {
    &self.config
  }

  pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
    &self.registry
  }

  /// Receiver that changes whenever processors should look for new work.
  pub fn wakeups(&self) -> watch::Receiver<u64> {
    self.notifier.tx.subscribe()
  }

  fn row_cursor(&self, row_key: &[u8]) -> Arc<Mutex<RowCursor>> {
    let cursor = self.rows.entry(row_key.to_vec()).or_insert_with(|| {
      Arc::new(Mutex::new(RowCursor {
        last_timestamp: 0,
        next_seq: 0,
      }))
    });
    Arc::clone(cursor.value())
  }

  fn allocate_id(cursor: &mut RowCursor, row_key: &[u8]) -> MessageId {
    let now = chrono::Utc::now().timestamp_millis();
    let timestamp = now.max(cursor.last_timestamp);
    let seq_nr = cursor.next_seq;
    cursor.last_timestamp = timestamp;
    cursor.next_seq += 1;
    MessageId::new(timestamp, row_key, seq_nr)
  }

  async fn registered_ids(&self) -> Result<HashSet<String>> {
    Ok(self.registry.list().await?.into_iter().map(|s| s.id).collect())
  }

  /// Append a message for `row_key`, owed by every subscription registered now.
  ///
  /// Storage failures are returned; nothing is swallowed.
  pub async fn append(&self, row_key: &[u8], payload: Option<Vec<u8>>) -> Result<RowLogMessage> {
    let subscriptions: Vec<String> = self.registry.list().await?.into_iter().map(|s| s.id).collect();

    let row_cursor = self.row_cursor(row_key);
    let mut cursor = row_cursor.lock().await;

    if subscriptions.is_empty() {
      let id = Self::allocate_id(&mut cursor, row_key);
      trace!(message = %id, "No subscriptions, message not stored");
      return Ok(RowLogMessage::with_payload(id, payload));
    }

    let state: ExecutionState = subscriptions
      .iter()
      .map(|id| (id.clone(), SubscriptionState::pending()))
      .collect();

    let mut attempts = 0;
    let id = loop {
      let id = Self::allocate_id(&mut cursor, row_key);
      let row = MessageRow {
        payload: payload.clone(),
        state: state.clone(),
      };
      match self.table.put_row(&id, row, None).await {
        Ok(_) => break id,
        // Id already taken, e.g. by a previous process for this row
        Err(LogTableError::Conflict(_)) if attempts < self.config.max_state_retries => attempts += 1,
        Err(LogTableError::Conflict(_)) => return Err(RowLogError::Contention(id.to_string())),
        Err(e) => return Err(e.into()),
      }
    };

    self.shard.put_message(&id, &subscriptions).await?;
    drop(cursor);
    debug!(message = %id, subscriptions = subscriptions.len(), "Message appended");

    self.notifier.notify();
    Ok(RowLogMessage::with_payload(id, payload))
  }

  /// Up to `limit` messages still pending for `subscription_id`, oldest first.
  ///
  /// The subscription is read fresh on every call. An unknown subscription
  /// yields an empty batch.
  pub async fn next(&self, subscription_id: &str, limit: usize) -> Result<Vec<Arc<RowLogMessage>>> {
    let Some(subscription) = self.registry.get(subscription_id).await? else {
      return Ok(Vec::new());
    };

    let now = chrono::Utc::now().timestamp_millis();
    let ids = self.shard.next(&subscription, limit, now).await?;

    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
      let row = self.table.get_row(&id).await?;
      let pending = row
        .as_ref()
        .and_then(|row| row.row.state.get(subscription_id))
        .is_some_and(|state| !state.is_done());

      match row {
        Some(row) if pending => {
          let inline = row
            .row
            .payload
            .as_ref()
            .is_none_or(|p| p.len() <= self.config.inline_payload_limit);
          let message = if inline {
            RowLogMessage::with_payload(id, row.row.payload)
          } else {
            RowLogMessage::new(id)
          };
          messages.push(Arc::new(message));
        }
        _ => {
          // Left behind by an interrupted mark_done
          trace!(message = %id, subscription = subscription_id, "Dropping stale shard entry");
          self.shard.remove_message(&id, subscription_id).await?;
        }
      }
    }

    Ok(messages)
  }

  /// Mark `id` done for `subscription_id`.
  ///
  /// Returns `true` when this was the last pending subscription and the
  /// message was removed. Subscriptions that no longer exist count as done.
  pub async fn mark_done(&self, id: &MessageId, subscription_id: &str) -> Result<bool> {
    let registered = self.registered_ids().await?;

    for _ in 0..self.config.max_state_retries.max(1) {
      let Some(current) = self.table.get_row(id).await? else {
        self.shard.remove_message(id, subscription_id).await?;
        return Ok(false);
      };

      let mut state = current.row.state.clone();
      if let Some(entry) = state.get_mut(subscription_id) {
        entry.status = SubscriptionStatus::Done;
      }
      let finished = state
        .iter()
        .all(|(sub, entry)| entry.is_done() || !registered.contains(sub));

      let written = if finished {
        self.table.delete_row(id, current.revision).await
      } else {
        let row = MessageRow {
          payload: current.row.payload.clone(),
          state: state.clone(),
        };
        self.table.put_row(id, row, Some(current.revision)).await.map(|_| ())
      };

      match written {
        Ok(()) => {
          self.shard.remove_message(id, subscription_id).await?;
          if finished {
            for sub in state.keys().filter(|sub| *sub != subscription_id) {
              self.shard.remove_message(id, sub).await?;
            }
            trace!(message = %id, "Message done for all subscriptions, removed");
          }
          return Ok(finished);
        }
        Err(LogTableError::Conflict(_)) => continue,
        Err(e) => return Err(e.into()),
      }
    }

    Err(RowLogError::Contention(id.to_string()))
  }

  /// Record a failed attempt; the message stays pending. Returns the new try count.
  pub async fn record_failure(&self, id: &MessageId, subscription_id: &str) -> Result<u32> {
    for _ in 0..self.config.max_state_retries.max(1) {
      let Some(current) = self.table.get_row(id).await? else {
        return Err(RowLogError::MessageNotFound(id.to_string()));
      };

      let mut state = current.row.state.clone();
      let Some(entry) = state.get_mut(subscription_id) else {
        return Err(RowLogError::MessageNotFound(id.to_string()));
      };
      entry.try_count += 1;
      let try_count = entry.try_count;

      let row = MessageRow {
        payload: current.row.payload.clone(),
        state,
      };
      match self.table.put_row(id, row, Some(current.revision)).await {
        Ok(_) => {
          if try_count >= self.config.warn_after_tries {
            warn!(message = %id, subscription = subscription_id, try_count, "Message keeps failing");
          }
          return Ok(try_count);
        }
        Err(LogTableError::Conflict(_)) => continue,
        Err(e) => return Err(e.into()),
      }
    }

    Err(RowLogError::Contention(id.to_string()))
  }

  /// Current execution state of a message, `None` once it has been removed.
  pub async fn state(&self, id: &MessageId) -> Result<Option<ExecutionState>> {
    Ok(self.table.get_row(id).await?.map(|row| row.row.state))
  }

  pub(crate) async fn fetch_payload(&self, id: &MessageId) -> Result<Option<Vec<u8>>> {
    match self.table.get_row(id).await? {
      Some(row) => Ok(row.row.payload),
      None => Err(RowLogError::MessageNotFound(id.to_string())),
    }
  }

  /// Remove messages only removed subscriptions still owe, and shard entries
  /// of removed subscriptions. Returns the number of messages removed.
  pub async fn purge_orphans(&self) -> Result<usize> {
    let registered = self.registered_ids().await?;
    let page_size = self.config.scan_page_size.max(1);

    for sub in self.table.shard_subscriptions().await? {
      if registered.contains(&sub) {
        continue;
      }
      loop {
        let ids = self.table.scan_shard(&sub, None, page_size).await?;
        if ids.is_empty() {
          break;
        }
        for id in ids {
          self.table.remove_shard_entry(&sub, &id).await?;
        }
      }
      debug!(subscription = %sub, "Dropped shard of removed subscription");
    }

    let mut purged = 0;
    let mut after: Option<MessageId> = None;
    loop {
      let page = self.table.scan_rows(after.as_ref(), page_size).await?;
      let exhausted = page.len() < page_size;

      for row in page {
        after = Some(row.id.clone());
        let orphaned = row
          .row
          .state
          .iter()
          .all(|(sub, entry)| entry.is_done() || !registered.contains(sub));
        if !orphaned {
          continue;
        }
        match self.table.delete_row(&row.id, row.revision).await {
          Ok(()) => purged += 1,
          // Touched meanwhile, the next purge will look again
          Err(LogTableError::Conflict(_)) => {}
          Err(e) => return Err(e.into()),
        }
      }

      if exhausted {
        break;
      }
    }

    if purged > 0 {
      info!(log = %self.config.id, purged, "Purged orphaned messages");
    }
    Ok(purged)
  }
}
