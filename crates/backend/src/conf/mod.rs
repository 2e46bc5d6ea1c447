//! Indexing configuration: index rules, shard routing and the atomically
//! swapped generation that bundles them.

mod case;
mod generation;
mod indexer_conf;
mod sharding;
mod wildcard;

use std::path::PathBuf;

pub use self::{
  case::{ANY_DIMENSIONS, IndexCase, parse_variant_entry},
  generation::{GenerationHandle, IndexerGeneration},
  indexer_conf::{IndexField, IndexerConf},
  sharding::{HashShardSelector, RuleMatch, RuleShardSelector, ShardMap, ShardSelector},
  wildcard::WildcardPattern,
};

/// Rejected configuration. The generation in use stays active.
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
  #[error("Failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid index rule document: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("Invalid sharding document: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Invalid wildcard pattern '{0}': only a single leading or trailing * is supported")]
  Pattern(String),
  #[error("Invalid variant pattern entry '{0}'")]
  Variant(String),
  #[error("Unknown version tag '{0}'")]
  UnknownVersionTag(String),
  #[error("Case #{0} lists no version tags")]
  NoVersionTags(usize),
  #[error("Invalid index field: {0}")]
  Field(String),
  #[error("Sharding rule refers to unknown shard '{0}'")]
  UnknownShard(String),
  #[error("No search shards configured")]
  NoShards,
}
