use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{MessageConsumer, ProcessResult};
use crate::rowlog::{MessageId, RowLog, RowLogMessage};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("Listener {0} is unreachable")]
  Unreachable(String),
  #[error("Listener {listener} rejected message: {reason}")]
  Rejected { listener: String, reason: String },
}

/// Delivers messages to listeners of remote subscriptions (another process
/// registered under the subscription).
#[async_trait]
pub trait ListenerTransport: Send + Sync {
  /// Returns whether the listener processed the message successfully.
  async fn deliver(&self, listener: &str, id: &MessageId, payload: Option<Vec<u8>>) -> Result<bool, TransportError>;
}

/// Consumer of a remote subscription: hands each message to one of the
/// subscription's listeners, round robin, failing over to the next on
/// transport errors.
pub struct RemoteConsumer {
  subscription_id: String,
  rowlog: Arc<RowLog>,
  transport: Arc<dyn ListenerTransport>,
  next: AtomicUsize,
}

impl RemoteConsumer {
  pub fn new(subscription_id: impl Into<String>, rowlog: Arc<RowLog>, transport: Arc<dyn ListenerTransport>) -> Self {
    Self {
      subscription_id: subscription_id.into(),
      rowlog,
      transport,
      next: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl MessageConsumer for RemoteConsumer {
  async fn process(&self, message: Arc<RowLogMessage>) -> ProcessResult {
    let listeners = match self.rowlog.registry().listeners(&self.subscription_id).await {
      Ok(listeners) => listeners,
      Err(e) => {
        warn!(subscription = %self.subscription_id, error = %e, "Could not list listeners");
        return ProcessResult::Retry;
      }
    };
    if listeners.is_empty() {
      debug!(subscription = %self.subscription_id, message = %message.id(), "No listeners registered");
      return ProcessResult::Retry;
    }

    let payload = match message.payload(&self.rowlog).await {
      Ok(payload) => payload,
      Err(e) => {
        warn!(message = %message.id(), error = %e, "Could not load payload");
        return ProcessResult::Retry;
      }
    };

    let start = self.next.fetch_add(1, Ordering::Relaxed);
    for offset in 0..listeners.len() {
      let listener = &listeners[(start + offset) % listeners.len()];
      match self.transport.deliver(listener, message.id(), payload.clone()).await {
        Ok(true) => return ProcessResult::Done,
        Ok(false) => {
          debug!(listener = %listener, message = %message.id(), "Listener did not process message");
          return ProcessResult::Retry;
        }
        Err(e) => warn!(listener = %listener, message = %message.id(), error = %e, "Delivery failed, trying next listener"),
      }
    }

    ProcessResult::Retry
  }
}
