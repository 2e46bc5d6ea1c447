//! Keeps one [`SubscriptionProcessor`] running per subscription this process
//! serves, following the registry as subscriptions come and go.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
  ListenerTransport, MessageConsumer, PoolError, ProcessorHandle, RemoteConsumer, SubscriptionProcessor,
};
use crate::{
  domain::config::IndexerSettings,
  rowlog::{RowLog, SubscriptionKind},
};

const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

pub struct ProcessorHost {
  rowlog: Arc<RowLog>,
  settings: IndexerSettings,
  consumers: HashMap<String, Arc<dyn MessageConsumer>>,
  transport: Option<Arc<dyn ListenerTransport>>,
  resync_interval: Duration,
}

impl ProcessorHost {
  pub fn new(rowlog: Arc<RowLog>, settings: IndexerSettings) -> Self {
    Self {
      rowlog,
      settings,
      consumers: HashMap::new(),
      transport: None,
      resync_interval: DEFAULT_RESYNC_INTERVAL,
    }
  }

  /// Serve local subscription `subscription_id` with `consumer`.
  pub fn with_consumer(mut self, subscription_id: impl Into<String>, consumer: Arc<dyn MessageConsumer>) -> Self {
    self.consumers.insert(subscription_id.into(), consumer);
    self
  }

  /// Serve every remote subscription through `transport`.
  pub fn with_transport(mut self, transport: Arc<dyn ListenerTransport>) -> Self {
    self.transport = Some(transport);
    self
  }

  /// How often to re-read the registry when no change was signalled.
  pub fn with_resync_interval(mut self, interval: Duration) -> Self {
    self.resync_interval = interval;
    self
  }

  pub fn spawn(self) -> HostHandle {
    let cancel = CancellationToken::new();
    let running = Arc::new(DashSet::new());
    let join = tokio::spawn(self.run(cancel.clone(), Arc::clone(&running)));
    HostHandle { cancel, join, running }
  }

  async fn run(self, cancel: CancellationToken, running: Arc<DashSet<String>>) -> Result<(), PoolError> {
    info!(log = %self.rowlog.id(), local = self.consumers.len(), remote = self.transport.is_some(), "Processor host started");

    let mut changes = self.rowlog.registry().changes();
    let mut changes_open = true;
    let mut processors: HashMap<String, ProcessorHandle> = HashMap::new();
    let mut first_error = None;

    loop {
      self.reconcile(&mut processors, &mut first_error).await;
      for id in processors.keys() {
        running.insert(id.clone());
      }
      running.retain(|id| processors.contains_key(id));

      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        alive = changes.changed(), if changes_open => {
          if !alive {
            warn!("Registry change stream closed, falling back to periodic resync");
            changes_open = false;
          }
        }
        _ = tokio::time::sleep(self.resync_interval) => {}
      }
    }

    let grace = self.settings.shutdown_grace();
    for (id, handle) in processors.drain() {
      running.remove(&id);
      if let Err(e) = handle.stop(grace).await {
        error!(subscription = %id, error = %e, "Processor did not stop cleanly");
        first_error.get_or_insert(e);
      }
    }

    info!(log = %self.rowlog.id(), "Processor host stopped");
    first_error.map_or(Ok(()), Err)
  }

  fn consumer_for(&self, id: &str, kind: SubscriptionKind) -> Option<Arc<dyn MessageConsumer>> {
    match kind {
      SubscriptionKind::Local => self.consumers.get(id).cloned(),
      SubscriptionKind::Remote => self.transport.as_ref().map(|transport| {
        Arc::new(RemoteConsumer::new(id, Arc::clone(&self.rowlog), Arc::clone(transport))) as Arc<dyn MessageConsumer>
      }),
    }
  }

  async fn reconcile(&self, processors: &mut HashMap<String, ProcessorHandle>, first_error: &mut Option<PoolError>) {
    let subscriptions = match self.rowlog.registry().list().await {
      Ok(subscriptions) => subscriptions,
      Err(e) => {
        warn!(error = %e, "Could not list subscriptions, keeping current processors");
        return;
      }
    };

    let mut wanted = HashMap::new();
    for subscription in subscriptions {
      if let Some(consumer) = self.consumer_for(&subscription.id, subscription.kind) {
        wanted.insert(subscription.id, consumer);
      }
    }

    let stale: Vec<String> = processors.keys().filter(|id| !wanted.contains_key(*id)).cloned().collect();
    for id in stale {
      if let Some(handle) = processors.remove(&id) {
        debug!(subscription = %id, "Subscription gone, stopping processor");
        if let Err(e) = handle.stop(self.settings.shutdown_grace()).await {
          warn!(subscription = %id, error = %e, "Processor did not stop cleanly");
          first_error.get_or_insert(e);
        }
      }
    }

    for (id, consumer) in wanted {
      if processors.contains_key(&id) {
        continue;
      }
      debug!(subscription = %id, "Starting processor");
      let processor = SubscriptionProcessor::new(id.clone(), Arc::clone(&self.rowlog), consumer, &self.settings);
      processors.insert(id, processor.spawn());
    }
  }
}

/// Running host.
pub struct HostHandle {
  cancel: CancellationToken,
  join: JoinHandle<Result<(), PoolError>>,
  running: Arc<DashSet<String>>,
}

impl HostHandle {
  /// Subscriptions that currently have a processor, sorted.
  pub fn running(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.running.iter().map(|id| id.clone()).collect();
    ids.sort();
    ids
  }

  /// Stop every processor. Returns the first processor that failed to drain
  /// within the grace period.
  pub async fn shutdown(self) -> Result<(), PoolError> {
    self.cancel.cancel();
    match self.join.await {
      Ok(result) => result,
      Err(e) => {
        error!(error = %e, "Processor host task failed");
        Ok(())
      }
    }
  }
}
