//! Index rule document.
//!
//! ```toml
//! [[case]]
//! record_type_namespace = "org.books*"
//! record_type_name = "Book"
//! variant = ["lang=en", "*"]
//! version_tags = ["live"]
//!
//! [[field]]
//! name = "title"
//! source = "title"
//! ```
//!
//! Cases are evaluated in document order and the first match wins. `variant`
//! entries are `key=value` (exact value), `key` (any value) or `*` (further
//! dimensions allowed). Without `*` a record must have exactly the listed
//! dimensions.

use std::{
  collections::{BTreeMap, BTreeSet, HashSet},
  path::Path,
};

use serde::Deserialize;

use super::{
  ConfError, WildcardPattern,
  case::{IndexCase, parse_variant_entry},
};
use crate::{
  domain::record::QName,
  indexer::SYSTEM_FIELDS,
  repository::TypeCatalog,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConf {
  #[serde(default, rename = "case")]
  cases: Vec<RawCase>,
  #[serde(default, rename = "field")]
  fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
  #[serde(default = "any")]
  record_type_namespace: String,
  #[serde(default = "any")]
  record_type_name: String,
  #[serde(default)]
  variant: Vec<String>,
  version_tags: Vec<String>,
}

fn any() -> String {
  "*".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
  name: String,
  source: Option<String>,
}

/// Maps a record field onto a document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexField {
  pub name: String,
  pub source: String,
}

/// Validated, immutable index rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexerConf {
  cases: Vec<IndexCase>,
  fields: Vec<IndexField>,
}

impl IndexerConf {
  pub fn new(cases: Vec<IndexCase>, fields: Vec<IndexField>) -> Self {
    Self { cases, fields }
  }

  /// Parse and validate a TOML document. Every version tag must be known to `catalog`.
  pub fn parse(toml_str: &str, catalog: &dyn TypeCatalog) -> Result<Self, ConfError> {
    let raw: RawConf = toml::from_str(toml_str)?;

    let mut cases = Vec::with_capacity(raw.cases.len());
    for (index, raw_case) in raw.cases.into_iter().enumerate() {
      if raw_case.version_tags.is_empty() {
        return Err(ConfError::NoVersionTags(index));
      }
      for tag in &raw_case.version_tags {
        if !catalog.has_version_tag(tag) {
          return Err(ConfError::UnknownVersionTag(tag.clone()));
        }
      }

      let variant = raw_case
        .variant
        .iter()
        .map(|entry| parse_variant_entry(entry))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

      cases.push(IndexCase::new(
        raw_case.record_type_namespace.parse::<WildcardPattern>()?,
        raw_case.record_type_name.parse::<WildcardPattern>()?,
        variant,
        raw_case.version_tags.into_iter().collect(),
      ));
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(raw.fields.len());
    for raw_field in raw.fields {
      if raw_field.name.is_empty() || SYSTEM_FIELDS.contains(&raw_field.name.as_str()) {
        return Err(ConfError::Field(format!("'{}' is not a usable field name", raw_field.name)));
      }
      if !seen.insert(raw_field.name.clone()) {
        return Err(ConfError::Field(format!("'{}' defined twice", raw_field.name)));
      }
      let source = raw_field.source.unwrap_or_else(|| raw_field.name.clone());
      fields.push(IndexField {
        name: raw_field.name,
        source,
      });
    }

    Ok(Self { cases, fields })
  }

  pub fn load(path: &Path, catalog: &dyn TypeCatalog) -> Result<Self, ConfError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content, catalog)
  }

  /// First case matching the record type and dimensions.
  pub fn matching_case(&self, record_type: &QName, dimensions: &BTreeMap<String, String>) -> Option<&IndexCase> {
    self.cases.iter().find(|case| case.matches(record_type, dimensions))
  }

  /// Every version tag any case can index.
  pub fn all_version_tags(&self) -> BTreeSet<String> {
    self
      .cases
      .iter()
      .flat_map(|case| case.version_tags().iter().cloned())
      .collect()
  }

  pub fn cases(&self) -> &[IndexCase] {
    &self.cases
  }

  pub fn fields(&self) -> &[IndexField] {
    &self.fields
  }
}
