use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
};

use super::{ConfError, WildcardPattern};
use crate::domain::record::QName;

/// Variant key meaning "any additional dimensions are accepted".
pub const ANY_DIMENSIONS: &str = "*";

/// One index rule: which records it covers and which version tags it indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCase {
  namespace: WildcardPattern,
  name: WildcardPattern,
  /// Dimension -> required value, `None` for any value
  variant: BTreeMap<String, Option<String>>,
  version_tags: BTreeSet<String>,
}

impl IndexCase {
  pub fn new(
    namespace: WildcardPattern,
    name: WildcardPattern,
    variant: BTreeMap<String, Option<String>>,
    version_tags: BTreeSet<String>,
  ) -> Self {
    Self {
      namespace,
      name,
      variant,
      version_tags,
    }
  }

  pub fn version_tags(&self) -> &BTreeSet<String> {
    &self.version_tags
  }

  pub fn variant_pattern(&self) -> &BTreeMap<String, Option<String>> {
    &self.variant
  }

  pub fn matches(&self, record_type: &QName, dimensions: &BTreeMap<String, String>) -> bool {
    if !self.namespace.light_match(&record_type.namespace) || !self.name.light_match(&record_type.name) {
      return false;
    }

    if self.variant.len() != dimensions.len() && !self.variant.contains_key(ANY_DIMENSIONS) {
      return false;
    }

    self
      .variant
      .iter()
      .filter(|(key, _)| key.as_str() != ANY_DIMENSIONS)
      .all(|(key, required)| match dimensions.get(key) {
        None => false,
        Some(actual) => required.as_ref().is_none_or(|required| required == actual),
      })
  }
}

impl fmt::Display for IndexCase {
  /// `{namespace}name [variant entries] -> version tags`
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let variant: Vec<String> = self
      .variant
      .iter()
      .map(|(key, value)| match value {
        Some(value) => format!("{}={}", key, value),
        None => key.clone(),
      })
      .collect();
    let tags: Vec<&str> = self.version_tags.iter().map(String::as_str).collect();
    write!(
      f,
      "{{{}}}{} [{}] -> {}",
      self.namespace,
      self.name,
      variant.join(", "),
      tags.join(", ")
    )
  }
}

/// Parse one variant pattern entry: `key=value`, `key` or `*`.
pub fn parse_variant_entry(entry: &str) -> Result<(String, Option<String>), ConfError> {
  let (key, value) = match entry.split_once('=') {
    Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
    None => (entry.trim(), None),
  };
  if key.is_empty() || (key == ANY_DIMENSIONS && value.is_some()) {
    return Err(ConfError::Variant(entry.to_string()));
  }
  Ok((key.to_string(), value))
}
