//! Subscription registry backed by the coordinator.
//!
//! Layout:
//!
//! ```text
//! {coordinator_root}/{rowlog_id}/subscriptions/{subscription_id}            JSON Subscription
//! {coordinator_root}/{rowlog_id}/subscriptions/{subscription_id}/listeners/{name}   ephemeral
//! ```
//!
//! Node data is replaced in a single write, so concurrent readers see either
//! the old or the new subscription, never a mix.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
  coordinator::{Coordinator, CoordinatorError, CreateMode, WatchEvent, child_path},
  domain::config::RowLogConfig,
};

const LISTENERS: &str = "listeners";

/// How messages for a subscription are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
  /// Processed by a consumer inside this process
  Local,
  /// Dispatched to registered remote listeners
  Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
  pub id: String,
  pub kind: SubscriptionKind,
  /// Listing order; ties broken by id
  #[serde(default)]
  pub order_nr: i32,
  /// Never expose two outstanding messages of the same row
  #[serde(default)]
  pub respect_order: bool,
  /// Messages younger than this are not delivered yet
  #[serde(default)]
  pub minimal_process_delay_ms: u64,
  /// Idle poll interval when no append notification arrives
  #[serde(default = "default_wakeup_timeout_ms")]
  pub wakeup_timeout_ms: u64,
}

fn default_wakeup_timeout_ms() -> u64 {
  5_000
}

impl Subscription {
  pub fn local(id: impl Into<String>) -> Self {
    Self::new(id, SubscriptionKind::Local)
  }

  pub fn remote(id: impl Into<String>) -> Self {
    Self::new(id, SubscriptionKind::Remote)
  }

  fn new(id: impl Into<String>, kind: SubscriptionKind) -> Self {
    Self {
      id: id.into(),
      kind,
      order_nr: 0,
      respect_order: false,
      minimal_process_delay_ms: 0,
      wakeup_timeout_ms: default_wakeup_timeout_ms(),
    }
  }

  pub fn with_order_nr(mut self, order_nr: i32) -> Self {
    self.order_nr = order_nr;
    self
  }

  pub fn respecting_order(mut self, respect_order: bool) -> Self {
    self.respect_order = respect_order;
    self
  }

  pub fn with_minimal_process_delay(mut self, delay: Duration) -> Self {
    self.minimal_process_delay_ms = delay.as_millis() as u64;
    self
  }

  pub fn with_wakeup_timeout(mut self, timeout: Duration) -> Self {
    self.wakeup_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn minimal_process_delay(&self) -> Duration {
    Duration::from_millis(self.minimal_process_delay_ms)
  }

  pub fn wakeup_timeout(&self) -> Duration {
    Duration::from_millis(self.wakeup_timeout_ms.max(1))
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("Subscription already exists: {0}")]
  AlreadyExists(String),
  #[error("Subscription not found: {0}")]
  NotFound(String),
  #[error("Invalid name: {0}")]
  InvalidName(String),
  #[error("Corrupt subscription data: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Coordinator error: {0}")]
  Coordinator(#[from] CoordinatorError),
}

impl RegistryError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Coordinator(e) if e.is_transient())
  }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

fn validate_name(name: &str) -> Result<()> {
  if name.is_empty() || name.contains('/') {
    return Err(RegistryError::InvalidName(name.to_string()));
  }
  Ok(())
}

/// Directory of the subscriptions of one row log.
pub struct SubscriptionRegistry {
  coordinator: Arc<dyn Coordinator>,
  root: String,
}

impl SubscriptionRegistry {
  pub fn new(coordinator: Arc<dyn Coordinator>, config: &RowLogConfig) -> Self {
    let root = child_path(&child_path(&config.coordinator_root, &config.id), "subscriptions");
    Self { coordinator, root }
  }

  pub fn root(&self) -> &str {
    &self.root
  }

  fn path(&self, id: &str) -> String {
    child_path(&self.root, id)
  }

  /// All subscriptions, sorted by `order_nr` then id.
  pub async fn list(&self) -> Result<Vec<Subscription>> {
    let names = match self.coordinator.children(&self.root).await {
      Ok(names) => names,
      Err(CoordinatorError::NoNode(_)) => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut subscriptions = Vec::with_capacity(names.len());
    for name in names {
      // Removed between listing and reading
      let Some(node) = self.coordinator.get(&self.path(&name)).await? else {
        continue;
      };
      match serde_json::from_slice::<Subscription>(&node.data) {
        Ok(subscription) => subscriptions.push(subscription),
        Err(e) => warn!(subscription = %name, error = %e, "Skipping unreadable subscription"),
      }
    }

    subscriptions.sort_by(|a, b| a.order_nr.cmp(&b.order_nr).then_with(|| a.id.cmp(&b.id)));
    Ok(subscriptions)
  }

  pub async fn get(&self, id: &str) -> Result<Option<Subscription>> {
    validate_name(id)?;
    match self.coordinator.get(&self.path(id)).await? {
      Some(node) => Ok(Some(serde_json::from_slice(&node.data)?)),
      None => Ok(None),
    }
  }

  pub async fn add(&self, subscription: &Subscription) -> Result<()> {
    validate_name(&subscription.id)?;
    let data = serde_json::to_vec(subscription)?;
    match self
      .coordinator
      .create(&self.path(&subscription.id), data, CreateMode::Persistent)
      .await
    {
      Ok(()) => {
        info!(subscription = %subscription.id, kind = ?subscription.kind, "Subscription added");
        Ok(())
      }
      Err(CoordinatorError::NodeExists(_)) => Err(RegistryError::AlreadyExists(subscription.id.clone())),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn update(&self, subscription: &Subscription) -> Result<()> {
    validate_name(&subscription.id)?;
    let data = serde_json::to_vec(subscription)?;
    match self.coordinator.set(&self.path(&subscription.id), data, None).await {
      Ok(_) => {
        debug!(subscription = %subscription.id, "Subscription updated");
        Ok(())
      }
      Err(CoordinatorError::NoNode(_)) => Err(RegistryError::NotFound(subscription.id.clone())),
      Err(e) => Err(e.into()),
    }
  }

  /// Remove a subscription together with its listener registrations.
  pub async fn remove(&self, id: &str) -> Result<()> {
    validate_name(id)?;
    let path = self.path(id);
    let listeners_path = child_path(&path, LISTENERS);

    for listener in self.listeners(id).await? {
      match self.coordinator.delete(&child_path(&listeners_path, &listener), None).await {
        Ok(()) | Err(CoordinatorError::NoNode(_)) => {}
        Err(e) => return Err(e.into()),
      }
    }
    match self.coordinator.delete(&listeners_path, None).await {
      Ok(()) | Err(CoordinatorError::NoNode(_)) => {}
      Err(e) => return Err(e.into()),
    }

    match self.coordinator.delete(&path, None).await {
      Ok(()) => {
        info!(subscription = %id, "Subscription removed");
        Ok(())
      }
      Err(CoordinatorError::NoNode(_)) => Err(RegistryError::NotFound(id.to_string())),
      Err(e) => Err(e.into()),
    }
  }

  /// Register a listener for a remote subscription. The registration is
  /// ephemeral and disappears with the registering session.
  pub async fn add_listener(&self, subscription_id: &str, listener: &str) -> Result<()> {
    validate_name(listener)?;
    if self.get(subscription_id).await?.is_none() {
      return Err(RegistryError::NotFound(subscription_id.to_string()));
    }
    let path = child_path(&child_path(&self.path(subscription_id), LISTENERS), listener);
    match self.coordinator.create(&path, Vec::new(), CreateMode::Ephemeral).await {
      Ok(()) | Err(CoordinatorError::NodeExists(_)) => {
        debug!(subscription = %subscription_id, listener, "Listener registered");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  pub async fn remove_listener(&self, subscription_id: &str, listener: &str) -> Result<()> {
    validate_name(subscription_id)?;
    validate_name(listener)?;
    let path = child_path(&child_path(&self.path(subscription_id), LISTENERS), listener);
    match self.coordinator.delete(&path, None).await {
      Ok(()) | Err(CoordinatorError::NoNode(_)) => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// Listener names of a subscription, sorted.
  pub async fn listeners(&self, subscription_id: &str) -> Result<Vec<String>> {
    validate_name(subscription_id)?;
    let path = child_path(&self.path(subscription_id), LISTENERS);
    match self.coordinator.children(&path).await {
      Ok(names) => Ok(names),
      Err(CoordinatorError::NoNode(_)) => Ok(Vec::new()),
      Err(e) => Err(e.into()),
    }
  }

  /// Stream of structural changes below this registry.
  pub fn changes(&self) -> RegistryChanges {
    RegistryChanges {
      events: self.coordinator.watch(),
      prefix: self.root.clone(),
    }
  }
}

/// Change notifications for one registry. Consumers refresh their view with
/// [`SubscriptionRegistry::list`] after each one.
pub struct RegistryChanges {
  events: broadcast::Receiver<WatchEvent>,
  prefix: String,
}

impl RegistryChanges {
  /// Wait for the next change. Returns `false` once the coordinator is gone.
  pub async fn changed(&mut self) -> bool {
    loop {
      match self.events.recv().await {
        Ok(event) if event.path().starts_with(&self.prefix) => return true,
        Ok(_) => continue,
        // Missed events may have touched the registry
        Err(broadcast::error::RecvError::Lagged(_)) => return true,
        Err(broadcast::error::RecvError::Closed) => return false,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::coordinator::MemoryCoordinator;

  fn registry(coordinator: &MemoryCoordinator) -> SubscriptionRegistry {
    SubscriptionRegistry::new(Arc::new(coordinator.clone()), &RowLogConfig::default())
  }

  #[tokio::test]
  async fn test_crud() {
    let coordinator = MemoryCoordinator::new();
    let registry = registry(&coordinator);

    assert!(registry.list().await.unwrap().is_empty());

    let sub = Subscription::local("indexer").respecting_order(true);
    registry.add(&sub).await.unwrap();
    assert!(matches!(registry.add(&sub).await, Err(RegistryError::AlreadyExists(_))));
    assert_eq!(registry.get("indexer").await.unwrap(), Some(sub.clone()));

    let updated = sub.clone().with_wakeup_timeout(Duration::from_millis(50));
    registry.update(&updated).await.unwrap();
    assert_eq!(registry.get("indexer").await.unwrap().unwrap().wakeup_timeout_ms, 50);

    registry.remove("indexer").await.unwrap();
    assert_eq!(registry.get("indexer").await.unwrap(), None);
    assert!(matches!(registry.remove("indexer").await, Err(RegistryError::NotFound(_))));
    assert!(matches!(
      registry.update(&sub).await,
      Err(RegistryError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_list_is_ordered() {
    let coordinator = MemoryCoordinator::new();
    let registry = registry(&coordinator);
    registry.add(&Subscription::local("b").with_order_nr(1)).await.unwrap();
    registry.add(&Subscription::local("c").with_order_nr(0)).await.unwrap();
    registry.add(&Subscription::remote("a").with_order_nr(1)).await.unwrap();

    let ids: Vec<_> = registry.list().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
  }

  #[tokio::test]
  async fn test_listeners_are_ephemeral() {
    let coordinator = MemoryCoordinator::new();
    let registry = registry(&coordinator);
    registry.add(&Subscription::remote("push")).await.unwrap();

    let client = coordinator.client();
    let remote_side = SubscriptionRegistry::new(Arc::new(client.clone()), &RowLogConfig::default());
    remote_side.add_listener("push", "host-a:9000").await.unwrap();
    registry.add_listener("push", "host-b:9000").await.unwrap();
    assert_eq!(registry.listeners("push").await.unwrap(), vec!["host-a:9000", "host-b:9000"]);

    client.expire_session().await;
    assert_eq!(registry.listeners("push").await.unwrap(), vec!["host-b:9000"]);

    assert!(matches!(
      registry.add_listener("missing", "x").await,
      Err(RegistryError::NotFound(_))
    ));

    // Removal takes listeners with it
    registry.remove("push").await.unwrap();
    assert!(registry.listeners("push").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_changes_fire_for_registry_paths_only() {
    let coordinator = MemoryCoordinator::new();
    let registry = registry(&coordinator);
    let mut changes = registry.changes();

    coordinator
      .create("/elsewhere", Vec::new(), CreateMode::Persistent)
      .await
      .unwrap();
    registry.add(&Subscription::local("s")).await.unwrap();

    let changed = tokio::time::timeout(Duration::from_secs(1), changes.changed()).await.unwrap();
    assert!(changed);
  }

  #[test]
  fn test_invalid_names() {
    assert!(validate_name("a/b").is_err());
    assert!(validate_name("").is_err());
    assert!(validate_name("indexer").is_ok());
  }
}
