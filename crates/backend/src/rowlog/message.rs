//! Messages and their per-subscription execution state.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{RowLog, RowLogError};

/// Unique, ordered identity of one log entry.
///
/// Ordering is `(timestamp, row_key, seq_nr)`, which for a single row equals
/// append order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
  /// Milliseconds since the epoch, never decreasing per row
  pub timestamp: i64,
  pub row_key: Vec<u8>,
  /// Per-row counter, disambiguates entries sharing a timestamp
  pub seq_nr: u64,
}

impl MessageId {
  pub fn new(timestamp: i64, row_key: impl Into<Vec<u8>>, seq_nr: u64) -> Self {
    Self {
      timestamp,
      row_key: row_key.into(),
      seq_nr,
    }
  }
}

impl fmt::Display for MessageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}@{}#{}",
      String::from_utf8_lossy(&self.row_key),
      self.timestamp,
      self.seq_nr
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
  Pending,
  Done,
}

/// One subscription's progress on one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
  pub status: SubscriptionStatus,
  /// Failed processing attempts so far
  pub try_count: u32,
}

impl SubscriptionState {
  pub fn pending() -> Self {
    Self {
      status: SubscriptionStatus::Pending,
      try_count: 0,
    }
  }

  pub fn is_done(&self) -> bool {
    self.status == SubscriptionStatus::Done
  }
}

/// Subscription id -> state, for every subscription known when the message was appended.
pub type ExecutionState = BTreeMap<String, SubscriptionState>;

/// A message handed to consumers.
///
/// The payload is fetched lazily from the log at most once per instance.
#[derive(Debug)]
pub struct RowLogMessage {
  id: MessageId,
  payload: OnceCell<Option<Vec<u8>>>,
}

impl RowLogMessage {
  pub fn new(id: MessageId) -> Self {
    Self {
      id,
      payload: OnceCell::new(),
    }
  }

  /// A message whose payload is already known.
  pub fn with_payload(id: MessageId, payload: Option<Vec<u8>>) -> Self {
    Self {
      id,
      payload: OnceCell::new_with(Some(payload)),
    }
  }

  pub fn id(&self) -> &MessageId {
    &self.id
  }

  pub fn row_key(&self) -> &[u8] {
    &self.id.row_key
  }

  pub fn timestamp(&self) -> i64 {
    self.id.timestamp
  }

  pub fn seq_nr(&self) -> u64 {
    self.id.seq_nr
  }

  /// Whether the payload has been fetched (or was delivered inline).
  pub fn payload_loaded(&self) -> bool {
    self.payload.initialized()
  }

  /// The payload, fetched from `log` on first access.
  ///
  /// Returns `MessageNotFound` if the entry has already been purged.
  pub async fn payload(&self, log: &RowLog) -> Result<Option<Vec<u8>>, RowLogError> {
    let payload = self
      .payload
      .get_or_try_init(|| async { log.fetch_payload(&self.id).await })
      .await?;
    Ok(payload.clone())
  }
}

impl PartialEq for RowLogMessage {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for RowLogMessage {}
