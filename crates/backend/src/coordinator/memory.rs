//! In-process coordinator.
//!
//! All handles created from one [`MemoryCoordinator`] via [`MemoryCoordinator::client`]
//! share the same tree but own distinct sessions, so ephemeral-node and
//! session-expiry behavior can be exercised without a real coordination service.

use std::{
  collections::{BTreeMap, HashSet},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use super::{Coordinator, CoordinatorError, CreateMode, Node, Result, SessionId, WatchEvent, validate_path};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
  data: Vec<u8>,
  version: u64,
  owner: Option<SessionId>,
}

#[derive(Debug, Default)]
struct Tree {
  nodes: BTreeMap<String, Entry>,
  expired: HashSet<SessionId>,
}

#[derive(Debug)]
struct Shared {
  tree: RwLock<Tree>,
  events: broadcast::Sender<WatchEvent>,
  next_session: AtomicU64,
  unreachable: AtomicBool,
}

/// Coordinator handle bound to one session.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
  shared: Arc<Shared>,
  session: SessionId,
}

impl Default for MemoryCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryCoordinator {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(WATCH_CAPACITY);
    let shared = Arc::new(Shared {
      tree: RwLock::new(Tree::default()),
      events,
      next_session: AtomicU64::new(1),
      unreachable: AtomicBool::new(false),
    });
    Self {
      session: SessionId(0),
      shared,
    }
  }

  /// A new handle on the same tree with its own session.
  pub fn client(&self) -> Self {
    let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
    Self {
      shared: Arc::clone(&self.shared),
      session: SessionId(id),
    }
  }

  /// End this handle's session: its ephemeral nodes disappear and later calls
  /// through this handle fail with `SessionExpired`.
  pub async fn expire_session(&self) {
    let removed: Vec<String> = {
      let mut tree = self.shared.tree.write().await;
      tree.expired.insert(self.session);
      let owned: Vec<String> = tree
        .nodes
        .iter()
        .filter(|(_, entry)| entry.owner == Some(self.session))
        .map(|(path, _)| path.clone())
        .collect();
      for path in &owned {
        tree.nodes.remove(path);
      }
      owned
    };

    info!(session = %self.session, ephemeral_nodes = removed.len(), "Session expired");
    for path in removed {
      let _ = self.shared.events.send(WatchEvent::Deleted(path));
    }
  }

  /// Simulate losing (or regaining) the connection for every handle.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.shared.unreachable.store(unreachable, Ordering::SeqCst);
  }

  fn check_available(&self, tree: &Tree) -> Result<()> {
    if self.shared.unreachable.load(Ordering::SeqCst) {
      return Err(CoordinatorError::ConnectionLoss);
    }
    if tree.expired.contains(&self.session) {
      return Err(CoordinatorError::SessionExpired(self.session));
    }
    Ok(())
  }

  fn emit(&self, event: WatchEvent) {
    // No receivers is fine
    let _ = self.shared.events.send(event);
  }
}

fn parent_paths(path: &str) -> Vec<String> {
  let mut parents = Vec::new();
  let mut current = path;
  while let Some(idx) = current.rfind('/') {
    if idx == 0 {
      break;
    }
    current = &current[..idx];
    parents.push(current.to_string());
  }
  parents.reverse();
  parents
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
  fn session(&self) -> SessionId {
    self.session
  }

  async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
    validate_path(path)?;
    if path == "/" {
      return Err(CoordinatorError::NodeExists(path.to_string()));
    }

    let mut created = Vec::new();
    {
      let mut tree = self.shared.tree.write().await;
      self.check_available(&tree)?;

      if tree.nodes.contains_key(path) {
        return Err(CoordinatorError::NodeExists(path.to_string()));
      }

      for parent in parent_paths(path) {
        if !tree.nodes.contains_key(&parent) {
          tree.nodes.insert(
            parent.clone(),
            Entry {
              data: Vec::new(),
              version: 0,
              owner: None,
            },
          );
          created.push(parent);
        }
      }

      let owner = match mode {
        CreateMode::Persistent => None,
        CreateMode::Ephemeral => Some(self.session),
      };
      tree.nodes.insert(path.to_string(), Entry { data, version: 0, owner });
      created.push(path.to_string());
    }

    debug!(path, ?mode, "Node created");
    for path in created {
      self.emit(WatchEvent::Created(path));
    }
    Ok(())
  }

  async fn get(&self, path: &str) -> Result<Option<Node>> {
    validate_path(path)?;
    let tree = self.shared.tree.read().await;
    self.check_available(&tree)?;
    Ok(tree.nodes.get(path).map(|entry| Node {
      data: entry.data.clone(),
      version: entry.version,
    }))
  }

  async fn set(&self, path: &str, data: Vec<u8>, expected_version: Option<u64>) -> Result<u64> {
    validate_path(path)?;
    let version = {
      let mut tree = self.shared.tree.write().await;
      self.check_available(&tree)?;
      let entry = tree
        .nodes
        .get_mut(path)
        .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;

      if let Some(expected) = expected_version
        && expected != entry.version
      {
        return Err(CoordinatorError::BadVersion {
          path: path.to_string(),
          expected,
          actual: entry.version,
        });
      }

      entry.data = data;
      entry.version += 1;
      entry.version
    };

    self.emit(WatchEvent::Changed(path.to_string()));
    Ok(version)
  }

  async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()> {
    validate_path(path)?;
    {
      let mut tree = self.shared.tree.write().await;
      self.check_available(&tree)?;
      let entry = tree
        .nodes
        .get(path)
        .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;

      if let Some(expected) = expected_version
        && expected != entry.version
      {
        return Err(CoordinatorError::BadVersion {
          path: path.to_string(),
          expected,
          actual: entry.version,
        });
      }

      let prefix = format!("{}/", path);
      if tree.nodes.range(prefix.clone()..).next().is_some_and(|(p, _)| p.starts_with(&prefix)) {
        return Err(CoordinatorError::NotEmpty(path.to_string()));
      }

      tree.nodes.remove(path);
    }

    debug!(path, "Node deleted");
    self.emit(WatchEvent::Deleted(path.to_string()));
    Ok(())
  }

  async fn children(&self, path: &str) -> Result<Vec<String>> {
    validate_path(path)?;
    let tree = self.shared.tree.read().await;
    self.check_available(&tree)?;

    if path != "/" && !tree.nodes.contains_key(path) {
      return Err(CoordinatorError::NoNode(path.to_string()));
    }

    let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
    let children = tree
      .nodes
      .range(prefix.clone()..)
      .take_while(|(p, _)| p.starts_with(&prefix))
      .filter_map(|(p, _)| {
        let rest = &p[prefix.len()..];
        (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
      })
      .collect();
    Ok(children)
  }

  fn watch(&self) -> broadcast::Receiver<WatchEvent> {
    self.shared.events.subscribe()
  }
}
