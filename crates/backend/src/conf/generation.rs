use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use super::{ConfError, IndexerConf, ShardMap};
use crate::{domain::config::IndexerSettings, repository::TypeCatalog};

/// One immutable indexing configuration.
#[derive(Debug)]
pub struct IndexerGeneration {
  pub number: u64,
  pub conf: Arc<IndexerConf>,
  pub shard_map: Arc<ShardMap>,
}

/// The current generation, replaced atomically on reload.
///
/// Workers call [`GenerationHandle::current`] once per message and keep the
/// returned `Arc` for the whole message, so a reload never changes the rules
/// halfway through processing one.
pub struct GenerationHandle {
  current: ArcSwap<IndexerGeneration>,
}

impl GenerationHandle {
  pub fn new(conf: IndexerConf, shard_map: ShardMap) -> Self {
    Self {
      current: ArcSwap::from_pointee(IndexerGeneration {
        number: 1,
        conf: Arc::new(conf),
        shard_map: Arc::new(shard_map),
      }),
    }
  }

  /// Build the first generation from settings.
  pub fn load(settings: &IndexerSettings, catalog: &dyn TypeCatalog) -> Result<Self, ConfError> {
    let (conf, shard_map) = build(settings, catalog)?;
    Ok(Self::new(conf, shard_map))
  }

  pub fn current(&self) -> Arc<IndexerGeneration> {
    self.current.load_full()
  }

  /// Install a new generation; returns its number. Concurrent installs get
  /// distinct, increasing numbers.
  pub fn install(&self, conf: IndexerConf, shard_map: ShardMap) -> u64 {
    let conf = Arc::new(conf);
    let shard_map = Arc::new(shard_map);
    let previous = self.current.rcu(|current| IndexerGeneration {
      number: current.number + 1,
      conf: Arc::clone(&conf),
      shard_map: Arc::clone(&shard_map),
    });
    let number = previous.number + 1;
    info!(generation = number, "Indexer configuration installed");
    number
  }

  /// Rebuild from settings. On error the previous generation stays in place.
  pub fn reload(&self, settings: &IndexerSettings, catalog: &dyn TypeCatalog) -> Result<u64, ConfError> {
    match build(settings, catalog) {
      Ok((conf, shard_map)) => Ok(self.install(conf, shard_map)),
      Err(e) => {
        warn!(
          error = %e,
          generation = self.current.load().number,
          "Rejected indexer configuration, keeping current generation"
        );
        Err(e)
      }
    }
  }
}

fn build(settings: &IndexerSettings, catalog: &dyn TypeCatalog) -> Result<(IndexerConf, ShardMap), ConfError> {
  let conf = match &settings.indexer_conf {
    Some(path) => IndexerConf::load(path, catalog)?,
    None => IndexerConf::default(),
  };
  let shard_map = ShardMap::load(&settings.shards, settings.sharding_conf.as_deref())?;
  Ok((conf, shard_map))
}
