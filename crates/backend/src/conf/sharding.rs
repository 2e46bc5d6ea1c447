//! Shard maps and shard selection.
//!
//! A [`ShardMap`] is immutable: reloading configuration builds a new one.
//! Selection is keyed on the record id and depends only on the map, so every
//! update of one record lands on the same shard for as long as the map lives.
//!
//! Sharding rule document (JSON), evaluated top to bottom:
//!
//! ```json
//! {
//!   "rules": [
//!     { "match": { "prefix": "USER." }, "shard": "shard1" },
//!     { "match": { "variantProperty": "lang", "equals": "en" }, "shard": "shard2" }
//!   ]
//! }
//! ```
//!
//! Records no rule matches fall back to hash selection.

use std::{collections::BTreeMap, fmt, path::Path};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::ConfError;
use crate::domain::record::RecordId;

/// Picks the index (into the ordered shard name list) for a record.
pub trait ShardSelector: Send + Sync + fmt::Debug {
  fn select(&self, key: &RecordId, shard_count: usize) -> usize;
}

/// Stable hash of the master record id modulo the shard count.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashShardSelector;

impl ShardSelector for HashShardSelector {
  fn select(&self, key: &RecordId, shard_count: usize) -> usize {
    let digest = Sha256::digest(key.master().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count.max(1) as u64) as usize
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RuleMatch {
  /// Master id starts with the prefix
  Prefix { prefix: String },
  /// Record has the variant property, optionally with a given value
  VariantProperty {
    #[serde(rename = "variantProperty")]
    property: String,
    #[serde(default)]
    equals: Option<String>,
  },
}

impl RuleMatch {
  fn matches(&self, key: &RecordId) -> bool {
    match self {
      Self::Prefix { prefix } => key.master().starts_with(prefix.as_str()),
      Self::VariantProperty { property, equals } => match key.variant_properties().get(property) {
        None => false,
        Some(value) => equals.as_ref().is_none_or(|expected| expected == value),
      },
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
  #[serde(rename = "match")]
  condition: RuleMatch,
  shard: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSharding {
  rules: Vec<RawRule>,
}

/// Declarative rules with hash fallback.
#[derive(Debug, Clone)]
pub struct RuleShardSelector {
  /// Condition and resolved shard index
  rules: Vec<(RuleMatch, usize)>,
}

impl ShardSelector for RuleShardSelector {
  fn select(&self, key: &RecordId, shard_count: usize) -> usize {
    self
      .rules
      .iter()
      .find(|(condition, _)| condition.matches(key))
      .map(|(_, index)| *index)
      .unwrap_or_else(|| HashShardSelector.select(key, shard_count))
  }
}

/// Shard name -> address, plus the selector that routes records to them.
#[derive(Debug)]
pub struct ShardMap {
  names: Vec<String>,
  addresses: BTreeMap<String, String>,
  selector: Box<dyn ShardSelector>,
}

impl ShardMap {
  /// Hash-routed map over `shards`.
  pub fn new(shards: &BTreeMap<String, String>) -> Result<Self, ConfError> {
    Self::with_selector(shards, Box::new(HashShardSelector))
  }

  pub fn with_selector(
    shards: &BTreeMap<String, String>,
    selector: Box<dyn ShardSelector>,
  ) -> Result<Self, ConfError> {
    if shards.is_empty() {
      return Err(ConfError::NoShards);
    }
    Ok(Self {
      names: shards.keys().cloned().collect(),
      addresses: shards.clone(),
      selector,
    })
  }

  /// Rule-routed map; every rule must name a configured shard.
  pub fn from_json(shards: &BTreeMap<String, String>, json: &str) -> Result<Self, ConfError> {
    if shards.is_empty() {
      return Err(ConfError::NoShards);
    }
    let raw: RawSharding = serde_json::from_str(json)?;
    let names: Vec<String> = shards.keys().cloned().collect();

    let rules = raw
      .rules
      .into_iter()
      .map(|rule| {
        names
          .iter()
          .position(|name| *name == rule.shard)
          .map(|index| (rule.condition, index))
          .ok_or(ConfError::UnknownShard(rule.shard))
      })
      .collect::<Result<Vec<_>, _>>()?;

    Self::with_selector(shards, Box::new(RuleShardSelector { rules }))
  }

  /// Hash-routed when `path` is `None`, rule-routed otherwise.
  pub fn load(shards: &BTreeMap<String, String>, path: Option<&Path>) -> Result<Self, ConfError> {
    match path {
      None => Self::new(shards),
      Some(path) => {
        let content = std::fs::read_to_string(path).map_err(|source| ConfError::Read {
          path: path.to_path_buf(),
          source,
        })?;
        Self::from_json(shards, &content)
      }
    }
  }

  pub fn select_shard(&self, key: &RecordId) -> &str {
    let index = self.selector.select(key, self.names.len());
    // Selectors return in-range indexes; clamp anyway for foreign selectors
    &self.names[index.min(self.names.len() - 1)]
  }

  pub fn address(&self, shard: &str) -> Option<&str> {
    self.addresses.get(shard).map(String::as_str)
  }

  /// Shard names in selection order.
  pub fn shard_names(&self) -> &[String] {
    &self.names
  }
}
